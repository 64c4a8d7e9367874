#[cfg(feature = "progress")]
use neural_style::Error;

use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "progress")]
use minifb::Window;

pub struct ProgressWindow {
    #[cfg(feature = "progress")]
    window: Option<(Window, std::time::Duration, std::time::Instant)>,

    pb: ProgressBar,
    len: u64,
}

impl ProgressWindow {
    pub fn new(iterations: u32) -> Self {
        let pb = ProgressBar::new(u64::from(iterations));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss {msg}")
                .progress_chars("##-"),
        );

        Self {
            #[cfg(feature = "progress")]
            window: None,
            pb,
            len: u64::from(iterations),
        }
    }

    #[cfg(feature = "progress")]
    pub fn with_preview(
        mut self,
        size: (u32, u32),
        update_every: std::time::Duration,
    ) -> Result<Self, Error> {
        let window = Window::new(
            "Neural Style",
            size.0 as usize,
            size.1 as usize,
            minifb::WindowOptions::default(),
        )
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;

        self.window = Some((window, update_every, std::time::Instant::now()));

        Ok(self)
    }
}

impl Drop for ProgressWindow {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl neural_style::GeneratorProgress for ProgressWindow {
    fn update(&mut self, update: neural_style::ProgressUpdate<'_>) {
        if u64::from(update.total) != self.len {
            self.len = u64::from(update.total);
            self.pb.set_length(self.len);
        }

        self.pb.set_position(u64::from(update.iteration));
        self.pb.set_message(&format!("{:.4}", update.loss));

        #[cfg(feature = "progress")]
        {
            if let Some((ref mut window, ref dur, ref mut last_update)) = self.window {
                let now = std::time::Instant::now();

                // always show the final image
                if now - *last_update < *dur && update.iteration != update.total {
                    return;
                }

                *last_update = now;

                if !window.is_open() {
                    return;
                }

                let img = match update.to_image() {
                    Ok(img) => img,
                    Err(_) => return,
                };

                // minifb wants 0RGB packed into a u32
                let pixels: Vec<u32> = img
                    .pixels()
                    .map(|p| (u32::from(p[0]) << 16) | (u32::from(p[1]) << 8) | u32::from(p[2]))
                    .collect();

                // We don't particularly care if this fails
                let _ = window.update_with_buffer(
                    &pixels,
                    img.width() as usize,
                    img.height() as usize,
                );
            }
        }
    }
}
