mod progress_window;

use progress_window::ProgressWindow;
use structopt::StructOpt;

use neural_style::{image::ImageOutputFormat as ImgFmt, Error, Init, LayerRef, Session};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn parse_img_fmt(input: &str) -> Result<ImgFmt, String> {
    let fmt = match input {
        "png" => ImgFmt::Png,
        "jpg" => ImgFmt::Jpeg(75),
        "bmp" => ImgFmt::Bmp,
        other => {
            return Err(format!(
                "image format `{}` not one of: 'png', 'jpg', 'bmp'",
                other
            ))
        }
    };

    Ok(fmt)
}

fn parse_init(input: &str) -> Result<Init, String> {
    match input {
        "content" => Ok(Init::Content),
        "noise" => Ok(Init::Noise),
        other => Err(format!("init `{}` not one of: 'content', 'noise'", other)),
    }
}

/// Layers can be given either by their feature index or by name
fn parse_layer(input: &str) -> LayerRef {
    match input.parse::<usize>() {
        Ok(index) => LayerRef::Index(index),
        Err(_) => LayerRef::Name(input.to_owned()),
    }
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Tweaks {
    /// The weight of the content loss
    #[structopt(long, default_value = "1.0")]
    content_weight: f32,
    /// The weight of each style layer, one per style layer. Defaults to 200
    /// for each of the default style layers
    #[structopt(long, use_delimiter = true)]
    style_weights: Vec<f32>,
    /// The weight of the total-variation loss, larger values produce
    /// smoother images
    #[structopt(long, default_value = "0.1")]
    tv_weight: f32,
    /// The feature layer the content loss is computed on, either an index
    /// into the feature maps or a layer name such as `relu4_2`
    #[structopt(long, parse(from_str = parse_layer))]
    content_layer: Option<LayerRef>,
    /// The feature layers the style loss is computed on, separated by commas
    #[structopt(long, use_delimiter = true, parse(from_str = parse_layer))]
    style_layers: Vec<LayerRef>,
    /// The network is applied up to, but not including, the first layer
    /// starting with this name. Use an empty string to keep the whole network
    #[structopt(long, default_value = "conv5_2")]
    truncate_at: String,
    /// What the generated image starts from, `content` or `noise`
    #[structopt(long, default_value = "content", parse(try_from_str = parse_init))]
    init: Init,
    /// The standard deviation of the initial noise when `--init noise` is used
    #[structopt(long, default_value = "1.0")]
    noise_std: f32,
    /// A seed value for the initial noise, runs with the same seed and inputs
    /// produce the same image
    #[structopt(long)]
    seed: Option<u64>,
    /// The number of optimizer steps
    #[structopt(short = "i", long, default_value = "500")]
    iterations: u32,
    /// The Adam learning rate
    #[structopt(long = "lr", default_value = "0.03")]
    learning_rate: f32,
    #[structopt(long, default_value = "0.9")]
    beta1: f32,
    #[structopt(long, default_value = "0.999")]
    beta2: f32,
    #[structopt(long = "eps", default_value = "1e-8")]
    epsilon: f32,
    /// The number of iterations between progress reports
    #[structopt(long, default_value = "50")]
    progress_interval: u32,
    #[structopt(long = "window")]
    #[cfg(feature = "progress")]
    #[cfg_attr(feature = "progress", structopt(long = "window"))]
    #[cfg_attr(
        feature = "progress",
        doc = "Show a window with the current state of the generated image"
    )]
    show_window: bool,
    /// Don't show a progress bar
    #[structopt(long)]
    no_progress: bool,
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Renders the content of one image in the style of another",
    rename_all = "kebab-case"
)]
struct Opt {
    /// The image whose structure is kept
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The image whose textures are transferred
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// The pretrained network, in the JSON model format
    #[structopt(long, parse(from_os_str))]
    model: PathBuf,
    /// The size of the larger side of the generated image
    #[structopt(long, default_value = "512")]
    out_size: u32,
    /// The size of the larger side of the style image, defaults to `--out-size`
    #[structopt(long)]
    style_size: Option<u32>,
    /// The format to save the generated image as.
    ///
    /// NOTE: this will only apply when stdout is specified via `-o -`, otherwise the image
    /// format is determined by the file extension of the path provided to `-o`
    #[structopt(
        long,
        default_value = "png",
        parse(try_from_str = parse_img_fmt)
    )]
    out_fmt: ImgFmt,
    /// The path to save the generated image to, the file extensions of the path determines
    /// the image format used. You may use `-` for stdout.
    #[structopt(long = "out", short, parse(from_os_str))]
    output_path: PathBuf,
    /// A file the loss of every iteration is written to, one per line
    #[structopt(long, parse(from_os_str))]
    loss_history: Option<PathBuf>,
    /// The maximum number of worker threads that can be active at any one time
    /// while running the network. Defaults to the logical core count.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    #[structopt(flatten)]
    tweaks: Tweaks,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    // Check that the extension for the path supplied by the user is one of the ones we support
    {
        match args.output_path.extension().and_then(|ext| ext.to_str()) {
            Some("png") | Some("jpg") | Some("bmp") => {}
            None => {}
            Some(other) => return Err(Error::UnsupportedOutputFormat(other.to_owned())),
        }
    }

    let tweaks = args.tweaks;

    let mut sb = Session::builder()
        .content(&args.content)
        .style(&args.style)
        .model_path(&args.model)
        .output_size(args.out_size)
        .truncate_at(tweaks.truncate_at)
        .content_weight(tweaks.content_weight)
        .tv_weight(tweaks.tv_weight)
        .init(tweaks.init)
        .noise_std(tweaks.noise_std)
        .seed(tweaks.seed.unwrap_or_default())
        .iterations(tweaks.iterations)
        .learning_rate(tweaks.learning_rate)
        .beta1(tweaks.beta1)
        .beta2(tweaks.beta2)
        .epsilon(tweaks.epsilon)
        .progress_interval(tweaks.progress_interval);

    if let Some(size) = args.style_size {
        sb = sb.style_size(size);
    }

    if let Some(layer) = tweaks.content_layer {
        sb = sb.content_layer(layer);
    }

    if !tweaks.style_layers.is_empty() {
        sb = sb.style_layers(tweaks.style_layers);
    }

    if !tweaks.style_weights.is_empty() {
        sb = sb.style_weights(tweaks.style_weights);
    }

    if let Some(mt) = args.max_threads {
        sb = sb.max_thread_count(mt);
    }

    let session = sb.build()?;

    let progress: Option<Box<dyn neural_style::GeneratorProgress>> = if !tweaks.no_progress {
        let progress = ProgressWindow::new(tweaks.iterations);

        #[cfg(feature = "progress")]
        let progress = {
            if tweaks.show_window {
                let (height, width, _, _) = session.content().dim();
                progress.with_preview(
                    (width as u32, height as u32),
                    std::time::Duration::from_millis(100),
                )?
            } else {
                progress
            }
        };

        Some(Box::new(progress))
    } else {
        None
    };

    let generated = session.run(progress)?;

    if generated.was_cancelled() {
        tracing::warn!(
            iterations = generated.iterations(),
            "saving the image of a cancelled run"
        );
    }

    if let Some(ref path) = args.loss_history {
        generated.save_loss_history(path)?;
    }

    if args.output_path.to_str() == Some("-") {
        let out = std::io::stdout();
        let mut out = out.lock();
        generated.write(&mut out, args.out_fmt)?;
    } else {
        // This won't respect the output format specified by the user,
        // only the extension on the path they specify
        generated.save(&args.output_path)?;
    }

    Ok(())
}
