use neural_style as ns;
use ns::model::{Convolution, Layer, LayerOp, Pooling};
use ns::ndarray::{Array1, Array4};
use std::sync::Arc;

// Small deterministic weights so every test network is reproducible
fn filters(cin: usize, cout: usize) -> Array4<f32> {
    Array4::from_shape_fn((3, 3, cin, cout), |(y, x, i, o)| {
        let n = y * 31 + x * 17 + i * 7 + o * 3;
        ((n % 13) as f32 / 13.0 - 0.5) * 0.4
    })
}

fn conv(cin: usize, cout: usize) -> LayerOp {
    LayerOp::Convolution(Convolution::new(filters(cin, cout), Array1::zeros(cout)).unwrap())
}

fn identity_conv() -> LayerOp {
    let mut filters = Array4::zeros((3, 3, 3, 3));
    for c in 0..3 {
        filters[[1, 1, c, c]] = 1.0;
    }
    LayerOp::Convolution(Convolution::new(filters, Array1::zeros(3)).unwrap())
}

fn normalization() -> ns::Normalization {
    ns::Normalization::from_mean([127.5, 127.5, 127.5])
}

/// conv1_1, relu1_1, pool1, conv2_1, relu2_1
fn small_vgg() -> Arc<ns::Model> {
    Arc::new(ns::Model::new(
        vec![
            Layer::new("conv1_1", conv(3, 4)),
            Layer::new("relu1_1", LayerOp::Activation),
            Layer::new("pool1", LayerOp::Pooling(Pooling::default())),
            Layer::new("conv2_1", conv(4, 4)),
            Layer::new("relu2_1", LayerOp::Activation),
        ],
        normalization(),
    ))
}

fn gradient_image(width: u32, height: u32) -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_fn(width, height, |x, y| {
        ns::image::Rgb([
            (x * 255 / width) as u8,
            (y * 255 / height) as u8,
            ((x + y) * 97 % 255) as u8,
        ])
    }))
}

fn stripes(width: u32, height: u32) -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_fn(width, height, |x, _| {
        if (x / 2) % 2 == 0 {
            ns::image::Rgb([230, 200, 20])
        } else {
            ns::image::Rgb([20, 40, 180])
        }
    }))
}

fn solid(color: [u8; 3]) -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_pixel(
        12,
        12,
        ns::image::Rgb(color),
    ))
}

fn session<'a>() -> ns::SessionBuilder<'a> {
    ns::Session::builder()
        .content(gradient_image(16, 16))
        .style(stripes(16, 16))
        .model(small_vgg())
        .output_size(16)
        .content_layer("relu2_1")
        .style_layers(vec!["relu1_1", "relu2_1"])
        .style_weights(vec![200.0, 200.0])
        .max_thread_count(1)
}

#[test]
fn loss_decreases() {
    let generated = session()
        .iterations(30)
        .learning_rate(0.02)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    let history = generated.loss_history();
    assert_eq!(history.len(), 30);
    assert!(
        history[29] < history[0],
        "loss went from {} to {}",
        history[0],
        history[29]
    );
}

#[test]
fn identical_content_and_style_has_no_style_loss() {
    let session = session().style(gradient_image(16, 16)).build().unwrap();

    let targets = session.targets().unwrap();
    let features = session.extractor().extract(session.content()).unwrap();

    let style = ns::loss::style_loss(
        &features,
        &targets.style_layers,
        &targets.style_grams,
        &[200.0, 200.0],
    )
    .unwrap();
    assert_eq!(style, 0.0);

    let content = ns::loss::content_loss(1.0, &features[targets.content_layer], &targets.content)
        .unwrap();
    assert_eq!(content, 0.0);
}

#[test]
fn content_only_start_is_stationary() {
    let session = ns::Session::builder()
        .content(gradient_image(10, 10))
        .style(stripes(10, 10))
        .model(Arc::new(ns::Model::new(
            vec![Layer::new("conv1_1", identity_conv())],
            normalization(),
        )))
        .output_size(10)
        .content_layer(0usize)
        .style_layers(Vec::<usize>::new())
        .style_weights(Vec::new())
        .tv_weight(0.0)
        .iterations(5)
        .build()
        .unwrap();

    let content = session.content().clone();
    let generated = session.run(None).unwrap();

    assert_eq!(generated.as_tensor(), &content);
    assert!(generated.loss_history().iter().all(|l| *l == 0.0));
}

#[test]
fn converges_to_solid_content() {
    let generated = ns::Session::builder()
        .content(solid([180, 60, 90]))
        .style(stripes(12, 12))
        .model(Arc::new(ns::Model::new(
            vec![
                Layer::new("conv1_1", identity_conv()),
                Layer::new("relu1_1", LayerOp::Activation),
            ],
            normalization(),
        )))
        .output_size(12)
        .content_layer("conv1_1")
        .style_layers(vec!["relu1_1"])
        .style_weights(vec![0.0])
        .tv_weight(0.0)
        .init(ns::Init::Noise)
        .noise_std(0.1)
        .seed(3)
        .learning_rate(0.01)
        .iterations(300)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    let img = generated.into_image().unwrap().to_rgb8();
    for pixel in img.pixels() {
        for (c, expected) in [180i32, 60, 90].iter().enumerate() {
            let diff = (i32::from(pixel[c]) - expected).abs();
            assert!(diff <= 10, "channel {} is {} off", c, diff);
        }
    }
}

#[test]
fn noise_runs_are_deterministic() {
    let run = || {
        session()
            .init(ns::Init::Noise)
            .seed(42)
            .iterations(4)
            .build()
            .unwrap()
            .run(None)
            .unwrap()
    };

    let a = run();
    let b = run();

    assert_eq!(a.as_tensor(), b.as_tensor());
    assert_eq!(a.loss_history(), b.loss_history());
}

#[test]
fn preprocess_round_trip() {
    let original = gradient_image(9, 6);
    let norm = ns::Normalization::imagenet();

    let tensor = ns::preprocess(original.clone(), 9, &norm).unwrap();
    assert_eq!(tensor.shape(), &[6, 9, 3, 1]);

    let restored = ns::postprocess(&tensor, &norm).unwrap();
    assert_eq!(restored, original.to_rgb8());
}

#[test]
fn gradient_matches_finite_difference() {
    // no activations, so the loss is smooth everywhere
    let model = Arc::new(ns::Model::new(
        vec![
            Layer::new("conv1_1", conv(3, 3)),
            Layer::new("pool1", LayerOp::Pooling(Pooling::default())),
            Layer::new("conv2_1", conv(3, 2)),
        ],
        normalization(),
    ));

    let session = ns::Session::builder()
        .content(gradient_image(8, 8))
        .style(stripes(8, 8))
        .model(model)
        .output_size(8)
        .content_layer(1usize)
        .style_layers(vec![0usize, 1])
        .style_weights(vec![10.0, 10.0])
        .tv_weight(1.0)
        .build()
        .unwrap();

    let targets = session.targets().unwrap();
    let x = session.content().mapv(|v| v * 0.8) + 0.05;

    let (_, grad) = session.evaluate(&x, &targets).unwrap();
    let norm = grad.iter().map(|g| g * g).sum::<f32>().sqrt();
    assert!(norm > 0.0);

    let direction = &grad / norm;
    let h = 1e-2;
    let (plus, _) = session.evaluate(&(&x + &(&direction * h)), &targets).unwrap();
    let (minus, _) = session.evaluate(&(&x - &(&direction * h)), &targets).unwrap();

    let numeric = (plus - minus) / (2.0 * h);
    assert!(
        (numeric - norm).abs() <= 0.05 * norm,
        "numeric {} analytic {}",
        numeric,
        norm
    );
}

#[test]
fn cancel_from_progress_callback() {
    let token = ns::CancellationToken::new();
    let canceller = token.clone();

    let generated = session()
        .iterations(20)
        .progress_interval(3)
        .cancellation_token(token)
        .build()
        .unwrap()
        .run(Some(Box::new(move |_: ns::ProgressUpdate<'_>| {
            canceller.cancel();
        })))
        .unwrap();

    assert!(generated.was_cancelled());
    assert_eq!(generated.iterations(), 3);
}

#[test]
fn diverging_run_reports_instability() {
    let result = session()
        .content_weight(1e38)
        .init(ns::Init::Noise)
        .noise_std(1000.0)
        .iterations(5)
        .build()
        .unwrap()
        .run(None);

    match result {
        Err(ns::Error::NumericInstability(err)) => {
            assert_eq!(err.iteration, 0);
            assert_eq!(err.last_good_iteration, None);
            assert_eq!(err.quantity, "loss");
            assert_eq!(err.last_good_image.shape(), &[16, 16, 3, 1]);
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("expected the run to diverge"),
    }
}

#[test]
fn loads_models_through_cache() {
    let dir = std::env::temp_dir().join("neural-style-model-cache");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("identity.json");

    let mut weights = vec![0.0f32; 3 * 3 * 3 * 3];
    for c in 0..3 {
        // index of [1, 1, c, c] in a row-major (3, 3, 3, 3) array
        weights[(4 * 3 + c) * 3 + c] = 1.0;
    }

    let json = format!(
        r#"{{
            "layers": [
                {{ "name": "conv1_1", "weights": [
                    {{ "shape": [3, 3, 3, 3], "data": {:?} }},
                    {{ "shape": [3], "data": [0, 0, 0] }} ] }},
                {{ "name": "relu1_1" }}
            ],
            "meta": {{ "normalization": {{ "averageImage": [123.68, 116.779, 103.939] }} }}
        }}"#,
        weights
    );
    std::fs::write(&path, json).unwrap();

    let cache = ns::ModelCache::new();
    for _ in 0..2 {
        let session = ns::Session::builder()
            .content(gradient_image(8, 8))
            .style(stripes(8, 8))
            .model_path(&path)
            .model_cache(&cache)
            .output_size(8)
            .content_layer("conv1_1")
            .style_layers(vec!["relu1_1"])
            .style_weights(vec![1.0])
            .build()
            .unwrap();

        assert_eq!(session.layer_names().len(), 2);
    }

    assert!(cache.contains(&path.to_string_lossy()));
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn missing_model_weights_fail_the_build() {
    let model = br#"{
        "layers": [ { "name": "conv1_1" } ],
        "meta": { "normalization": { "averageImage": [0.5, 0.5, 0.5] } }
    }"#;

    match ns::Model::from_slice(model) {
        Err(ns::Error::ModelLoad(ns::ModelLoadError::MissingWeights(layer))) => {
            assert_eq!(layer, "conv1_1");
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("expected the model to be rejected"),
    }
}

#[test]
fn evaluates_targets_deeper_than_the_configured_layers() {
    let session = session()
        .content_layer("relu1_1")
        .style_layers(vec!["relu1_1"])
        .style_weights(vec![200.0])
        .build()
        .unwrap();

    // relu2_1 has as many channels as relu1_1, so the Gram shapes agree
    let mut targets = session.targets().unwrap();
    targets.style_layers = vec![3];

    let (loss, grad) = session.evaluate(session.content(), &targets).unwrap();
    assert!(loss.is_finite());
    assert_eq!(grad.shape(), session.content().shape());
}

#[test]
fn unreadable_inputs_are_errors() {
    let missing = std::env::temp_dir().join("neural-style-does-not-exist.png");

    assert!(matches!(
        session().content(ns::ImageSource::from_path(&missing)).build(),
        Err(ns::Error::Image(_))
    ));
    assert!(matches!(
        session()
            .content(ns::ImageSource::Memory(&b"definitely not an image"[..]))
            .build(),
        Err(ns::Error::Image(_))
    ));

    let missing_model = std::env::temp_dir().join("neural-style-does-not-exist.json");
    assert!(matches!(
        ns::Model::load(&missing_model),
        Err(ns::Error::Io(_))
    ));
    assert!(matches!(
        session().model_path(&missing_model).build(),
        Err(ns::Error::Io(_))
    ));
}
