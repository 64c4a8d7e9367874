use neural_style as ns;
use std::path::Path;

fn main() -> Result<(), ns::Error> {
    let session = ns::Session::builder()
        // the image whose structure we keep
        .content(&"imgs/content.jpg")
        // the image whose textures we want
        .style(&"imgs/style.jpg")
        // a VGG-19 exported to the JSON model format, the default layers
        // assume this network
        .model_path(Path::new("models/vgg19.json"))
        .output_size(256)
        .build()?;

    // generate an image that renders "content.jpg" in the style of "style.jpg"
    let generated = session.run(None)?;

    // save the result to the disk
    generated.save("out/01.png")
}
