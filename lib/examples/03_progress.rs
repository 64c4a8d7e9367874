use neural_style as ns;
use std::path::Path;

fn main() -> Result<(), ns::Error> {
    let token = ns::CancellationToken::new();
    let stopper = token.clone();

    let session = ns::Session::builder()
        .content(&"imgs/content.jpg")
        .style(&"imgs/style.jpg")
        .model_path(Path::new("models/vgg19.json"))
        .progress_interval(25)
        .cancellation_token(token)
        .build()?;

    let generated = session.run(Some(Box::new(move |update: ns::ProgressUpdate<'_>| {
        println!(
            "{}/{} loss: {:.3}",
            update.iteration, update.total, update.loss
        );

        if let Ok(img) = update.to_image() {
            let _ = img.save(format!("out/03_{:04}.png", update.iteration));
        }

        // good enough, stop early
        if update.loss < 1.0 {
            stopper.cancel();
        }
    })))?;

    if generated.was_cancelled() {
        println!("stopped after {} iterations", generated.iterations());
    }

    generated.save("out/03.png")
}
