use neural_style as ns;
use std::path::Path;

fn main() -> Result<(), ns::Error> {
    // the model is parsed once, and shared by every session built with the cache
    let cache = ns::ModelCache::new();
    let model = Path::new("models/vgg19.json");

    for (i, style) in ["imgs/style.jpg", "imgs/style2.jpg"].iter().enumerate() {
        let session = ns::Session::builder()
            .content(&"imgs/content.jpg")
            .style(style)
            .model_path(model)
            .model_cache(&cache)
            .iterations(200)
            .build()?;

        session.run(None)?.save(format!("out/04_{}.png", i))?;
    }

    Ok(())
}
