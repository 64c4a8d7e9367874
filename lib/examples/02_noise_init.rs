use neural_style as ns;
use std::path::Path;

fn main() -> Result<(), ns::Error> {
    let session = ns::Session::builder()
        .content(&"imgs/content.jpg")
        .style(&"imgs/style.jpg")
        .model_path(Path::new("models/vgg19.json"))
        // starting from noise takes more iterations, but the result leans
        // further towards the style
        .init(ns::Init::Noise)
        .noise_std(0.5)
        .seed(7)
        .iterations(1000)
        // pick layers by name instead of by feature index
        .content_layer("relu4_2")
        .style_layers(vec!["relu1_1", "relu2_1", "relu3_1", "relu4_1", "relu5_1"])
        .style_weights(vec![400.0, 300.0, 200.0, 100.0, 100.0])
        .build()?;

    let generated = session.run(None)?;

    generated.save_loss_history("out/02_loss.txt")?;
    generated.save("out/02.png")
}
