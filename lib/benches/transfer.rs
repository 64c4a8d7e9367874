use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use neural_style as ns;
use ns::model::{Convolution, Layer, LayerOp, Pooling};
use ns::ndarray::{Array1, Array4};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn conv(cin: usize, cout: usize) -> LayerOp {
    let filters = Array4::from_shape_fn((3, 3, cin, cout), |(y, x, i, o)| {
        (((y * 31 + x * 17 + i * 7 + o * 3) % 13) as f32 / 13.0 - 0.5) * 0.2
    });
    LayerOp::Convolution(Convolution::new(filters, Array1::zeros(cout)).unwrap())
}

// A scaled down VGG with the same layer naming, so the default truncation
// point and layer names can be used
fn mini_vgg() -> Arc<ns::Model> {
    let mut layers = Vec::new();
    let mut channels = 3;

    for (block, width) in [8, 16, 32].iter().enumerate() {
        for i in 1..=2 {
            layers.push(Layer::new(format!("conv{}_{}", block + 1, i), conv(channels, *width)));
            layers.push(Layer::new(format!("relu{}_{}", block + 1, i), LayerOp::Activation));
            channels = *width;
        }
        layers.push(Layer::new(
            format!("pool{}", block + 1),
            LayerOp::Pooling(Pooling::default()),
        ));
    }

    Arc::new(ns::Model::new(layers, ns::Normalization::imagenet()))
}

fn noise_image(dim: u32) -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_fn(dim, dim, |x, y| {
        let v = (x * 7919 + y * 104_729) % 251;
        ns::image::Rgb([v as u8, (v * 3 % 251) as u8, (v * 5 % 251) as u8])
    }))
}

fn builder<'a>(
    model: &Arc<ns::Model>,
    content: &ns::image::DynamicImage,
    style: &ns::image::DynamicImage,
    dim: u32,
) -> ns::SessionBuilder<'a> {
    ns::Session::builder()
        .content(content.clone())
        .style(style.clone())
        .model(Arc::clone(model))
        .output_size(dim)
        .content_layer("relu3_2")
        .style_layers(vec!["relu1_1", "relu2_1", "relu3_1"])
        .style_weights(vec![200.0; 3])
}

fn evaluate(c: &mut Criterion) {
    static DIM: u32 = 16;

    let model = mini_vgg();
    let content = noise_image(64);
    let style = noise_image(48);

    let mut group = c.benchmark_group("evaluate");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM, 8 * DIM].iter() {
        let session = builder(&model, &content, &style, *dim).build().unwrap();
        let targets = session.targets().unwrap();
        let image = session.initial_image();

        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, _| {
            b.iter(|| black_box(session.evaluate(&image, &targets).unwrap()));
        });
    }
    group.finish();
}

fn run(c: &mut Criterion) {
    static DIM: u32 = 16;

    let model = mini_vgg();
    let content = noise_image(64);
    let style = noise_image(48);

    let mut group = c.benchmark_group("run_10_iterations");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, &dim| {
            b.iter_custom(|iters| {
                let mut total_elapsed = Duration::new(0, 0);
                for _i in 0..iters {
                    let sess = builder(&model, &content, &style, dim)
                        .iterations(10)
                        .build()
                        .unwrap();

                    let start = Instant::now();
                    black_box(sess.run(None).unwrap());
                    total_elapsed += start.elapsed();
                }

                total_elapsed
            });
        });
    }
    group.finish();
}

criterion_group!(benches, evaluate, run);
criterion_main!(benches);
