use crate::*;
use crate::adam::{Adam, Step};
use crate::errors::{ConfigError, NumericInstability};
use crate::loss::{LossTargets, LossWeights};
use rand::{Rng, SeedableRng};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Style transfer session.
///
/// Calling `run()` optimizes a new image and returns it, consuming the
/// session in the process. You can provide a `GeneratorProgress`
/// implementation to periodically get updates with the current image and
/// its loss.
///
/// # Example
/// ```no_run
/// let session = neural_style::Session::builder()
///     .content(&"imgs/content.jpg")
///     .style(&"imgs/style.jpg")
///     .model_path(std::path::Path::new("models/vgg19.json"))
///     .iterations(200)
///     .build().expect("failed to build session");
///
/// let generated = session.run(None).expect("style transfer failed");
/// generated.save("out/stylized.png").expect("failed to save image");
/// ```
pub struct Session {
    extractor: FeatureExtractor,
    layer_names: LayerIndexMap,
    normalization: Normalization,
    content: ImageTensor,
    style: ImageTensor,
    content_layer: usize,
    style_layers: Vec<usize>,
    weights: LossWeights,
    cancel: Option<CancellationToken>,
    params: Parameters,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// The preprocessed content image
    pub fn content(&self) -> &ImageTensor {
        &self.content
    }

    /// The preprocessed style image
    pub fn style(&self) -> &ImageTensor {
        &self.style
    }

    /// The feature layers of the truncated network, by name
    pub fn layer_names(&self) -> &LayerIndexMap {
        &self.layer_names
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Computes the content features and style Gram matrices the image is
    /// optimized towards.
    pub fn targets(&self) -> Result<LossTargets, Error> {
        let content_trace = self.extractor.forward(&self.content, self.content_layer)?;
        let content = self
            .extractor
            .feature(&content_trace, self.content_layer)?
            .clone();

        let style_grams = match self.style_layers.iter().max() {
            Some(&deepest) => {
                let style_trace = self.extractor.forward(&self.style, deepest)?;
                self.style_layers
                    .iter()
                    .map(|&layer| {
                        let features = self.extractor.feature(&style_trace, layer)?;
                        Ok(loss::gram_matrix(features, true))
                    })
                    .collect::<Result<Vec<_>, Error>>()?
            }
            None => Vec::new(),
        };

        tracing::debug!(
            content = ?content.shape(),
            style_layers = style_grams.len(),
            "computed loss targets"
        );

        Ok(LossTargets {
            content_layer: self.content_layer,
            content,
            style_layers: self.style_layers.clone(),
            style_grams,
        })
    }

    /// The tensor the optimization starts from
    pub fn initial_image(&self) -> ImageTensor {
        match self.params.init {
            Init::Content => self.content.clone(),
            Init::Noise => {
                let mut rng = rand_pcg::Pcg32::seed_from_u64(self.params.seed);
                let std = self.params.noise_std;
                ImageTensor::from_shape_fn(self.content.raw_dim(), |_| {
                    let sample: f32 = rng.sample(rand_distr::StandardNormal);
                    sample * std
                })
            }
        }
    }

    /// Computes the total loss of `image` and its gradient w.r.t. `image`
    pub fn evaluate(
        &self,
        image: &ImageTensor,
        targets: &LossTargets,
    ) -> Result<(f32, ImageTensor), Error> {
        if image.shape() != self.content.shape() {
            return Err(Error::shape_mismatch(
                "generated image",
                self.content.shape(),
                image.shape(),
            ));
        }

        loss::check_style_lengths(
            targets.style_layers.len(),
            targets.style_grams.len(),
            self.weights.style.len(),
        )?;

        let deepest = targets
            .style_layers
            .iter()
            .copied()
            .fold(targets.content_layer, usize::max);
        let trace = self.extractor.forward(image, deepest)?;

        let mut feature_grads = Vec::with_capacity(targets.style_layers.len() + 1);

        let (mut total, content_grad) = loss::content_loss_grad(
            self.weights.content,
            self.extractor.feature(&trace, targets.content_layer)?,
            &targets.content,
        )?;
        feature_grads.push((targets.content_layer, content_grad));

        for ((&layer, gram), &weight) in targets
            .style_layers
            .iter()
            .zip(&targets.style_grams)
            .zip(&self.weights.style)
        {
            let (style_loss, style_grad) =
                loss::layer_style_loss_grad(self.extractor.feature(&trace, layer)?, gram, weight)?;
            total += style_loss;
            feature_grads.push((layer, style_grad));
        }

        let mut grad = self.extractor.backward(&trace, feature_grads)?;

        let (tv, tv_grad) = loss::tv_loss_grad(image, self.weights.tv);
        total += tv;
        grad += &tv_grad;

        Ok((total, grad))
    }

    /// Runs the optimization and outputs the generated image.
    pub fn run(self, progress: Option<Box<dyn GeneratorProgress>>) -> Result<GeneratedImage, Error> {
        let mut progress = progress;
        let total = self.params.iterations;

        tracing::info!(
            iterations = total,
            content_layer = self.content_layer,
            style_layers = ?self.style_layers,
            "initializing style transfer"
        );

        let targets = self.targets()?;
        let mut image = self.initial_image();
        let (h, w, c, b) = image.dim();
        let mut optimizer = Adam::new(
            self.params.learning_rate,
            self.params.beta1,
            self.params.beta2,
            self.params.epsilon,
            (h, w, c, b),
        );

        let mut loss_history = Vec::with_capacity(total as usize);
        let mut cancelled = false;

        for iteration in 0..total {
            if self.cancel.as_ref().map_or(false, CancellationToken::is_cancelled) {
                tracing::warn!(iteration, "style transfer cancelled");
                cancelled = true;
                break;
            }

            let (loss, grad) = self.evaluate(&image, &targets)?;

            let unstable = if !loss.is_finite() {
                Some("loss")
            } else if !grad.iter().all(|g| g.is_finite()) {
                Some("gradient")
            } else if optimizer.step(&mut image, &grad)? == Step::NonFinite {
                Some("update")
            } else {
                None
            };

            if let Some(quantity) = unstable {
                tracing::warn!(iteration, quantity, "optimization diverged");
                return Err(Error::NumericInstability(Box::new(NumericInstability {
                    iteration,
                    last_good_iteration: iteration.checked_sub(1),
                    quantity,
                    last_good_image: image,
                })));
            }

            loss_history.push(loss);

            let done = iteration + 1;
            if done % self.params.progress_interval == 0 || done == total {
                tracing::info!(iteration = done, total, loss, "style transfer progress");

                if let Some(progress) = &mut progress {
                    progress.update(ProgressUpdate {
                        image: &image,
                        normalization: &self.normalization,
                        iteration: done,
                        total,
                        loss,
                    });
                }
            }
        }

        Ok(GeneratedImage {
            tensor: image,
            normalization: self.normalization,
            loss_history,
            cancelled,
        })
    }
}

enum ModelSource<'a> {
    Loaded(Arc<Model>),
    Path(&'a Path),
}

/// Builds a session by setting parameters and adding the input images and
/// model, calling `build` will check all of the provided inputs to verify
/// that the run is well formed
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    model: Option<ModelSource<'a>>,
    model_cache: Option<&'a ModelCache>,
    cancel: Option<CancellationToken>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose structure the generated image keeps
    pub fn content<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(img.into());
        self
    }

    /// The image whose textures the generated image takes on
    pub fn style<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// Uses an already loaded model
    pub fn model(mut self, model: Arc<Model>) -> Self {
        self.model = Some(ModelSource::Loaded(model));
        self
    }

    /// Loads the model from a JSON file during `build`
    pub fn model_path(mut self, path: &'a Path) -> Self {
        self.model = Some(ModelSource::Path(path));
        self
    }

    /// Loads models given by path through `cache`, so that sessions sharing
    /// a cache parse each model file once
    pub fn model_cache(mut self, cache: &'a ModelCache) -> Self {
        self.model_cache = Some(cache);
        self
    }

    /// A token that can be used to stop the run early from another thread
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The size of the larger side of the content image, and thus the
    /// generated image.
    ///
    /// Default: 512
    pub fn output_size(mut self, size: u32) -> Self {
        self.params.output_size = size;
        self
    }

    /// The size of the larger side of the style image.
    ///
    /// Default: same as `output_size`
    pub fn style_size(mut self, size: u32) -> Self {
        self.params.style_size = Some(size);
        self
    }

    /// The network is applied up to, but not including, the first layer
    /// whose name starts with `name`. An empty name keeps the whole network.
    ///
    /// Default: `conv5_2`
    pub fn truncate_at<S: Into<String>>(mut self, name: S) -> Self {
        self.params.truncate_at = name.into();
        self
    }

    /// The feature layer the content loss is computed on, by feature index
    /// or by layer name.
    ///
    /// Default: 19 (`relu4_2` of VGG-19)
    pub fn content_layer<L: Into<LayerRef>>(mut self, layer: L) -> Self {
        self.params.content_layer = layer.into();
        self
    }

    /// Default: 1.0
    pub fn content_weight(mut self, weight: f32) -> Self {
        self.params.content_weight = weight;
        self
    }

    /// The feature layers the style loss is computed on. Must be as long as
    /// the style weights.
    ///
    /// Default: `[1, 5, 9, 17, 25]` (`relu1_1` to `relu5_1` of VGG-19)
    pub fn style_layers<L: Into<LayerRef>, I: IntoIterator<Item = L>>(mut self, layers: I) -> Self {
        self.params.style_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// One weight per style layer.
    ///
    /// Default: 200.0 for each of the default style layers
    pub fn style_weights<I: IntoIterator<Item = f32>>(mut self, weights: I) -> Self {
        self.params.style_weights = weights.into_iter().collect();
        self
    }

    /// Weight of the total-variation smoothness penalty.
    ///
    /// Default: 0.1
    pub fn tv_weight(mut self, weight: f32) -> Self {
        self.params.tv_weight = weight;
        self
    }

    /// What the optimization starts from.
    ///
    /// Default: `Init::Content`
    pub fn init(mut self, init: Init) -> Self {
        self.params.init = init;
        self
    }

    /// Standard deviation of the noise used by `Init::Noise`.
    ///
    /// Default: 1.0
    pub fn noise_std(mut self, std: f32) -> Self {
        self.params.noise_std = std;
        self
    }

    /// The seed of the noise used by `Init::Noise`, runs with the same
    /// inputs and seed produce the same image.
    ///
    /// Default: 0
    pub fn seed(mut self, value: u64) -> Self {
        self.params.seed = value;
        self
    }

    /// Number of optimizer steps.
    ///
    /// Default: 500
    pub fn iterations(mut self, count: u32) -> Self {
        self.params.iterations = count;
        self
    }

    /// Adam step size.
    ///
    /// Default: 0.03
    pub fn learning_rate(mut self, lr: f32) -> Self {
        self.params.learning_rate = lr;
        self
    }

    /// Default: 0.9
    pub fn beta1(mut self, beta: f32) -> Self {
        self.params.beta1 = beta;
        self
    }

    /// Default: 0.999
    pub fn beta2(mut self, beta: f32) -> Self {
        self.params.beta2 = beta;
        self
    }

    /// Default: 1e-8
    pub fn epsilon(mut self, eps: f32) -> Self {
        self.params.epsilon = eps;
        self
    }

    /// How many iterations pass between progress updates. An update is
    /// always sent after the last iteration.
    ///
    /// Default: 50
    pub fn progress_interval(mut self, every: u32) -> Self {
        self.params.progress_interval = every;
        self
    }

    /// The maximum number of threads used by the convolutions.
    ///
    /// Default: the number of logical cores
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters,
    /// images, or a bad model were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.check_parameters_validity()?;

        let content = self.content.ok_or(Error::MissingInput("content image"))?;
        let style = self.style.ok_or(Error::MissingInput("style image"))?;

        let model = match self.model.ok_or(Error::MissingInput("model"))? {
            ModelSource::Loaded(model) => model,
            ModelSource::Path(path) => match self.model_cache {
                Some(cache) => cache.load_path(path)?,
                None => Arc::new(Model::load(path)?),
            },
        };

        let params = self.params;

        let (extractor, layer_names) = build_feature_function(model, &params.truncate_at);
        let extractor = extractor
            .with_max_thread_count(params.max_thread_count.unwrap_or_else(num_cpus::get));

        let content_layer = params.content_layer.resolve(&layer_names)?;
        let style_layers = params
            .style_layers
            .iter()
            .map(|layer| layer.resolve(&layer_names))
            .collect::<Result<Vec<_>, _>>()?;

        if style_layers.len() != params.style_weights.len() {
            return Err(ConfigError::StyleWeightsMismatch {
                layers: style_layers.len(),
                weights: params.style_weights.len(),
            }
            .into());
        }

        let normalization = *extractor.model().normalization();
        let content = preprocess::preprocess(content, params.output_size, &normalization)?;
        let style = preprocess::preprocess(
            style,
            params.style_size.unwrap_or(params.output_size),
            &normalization,
        )?;

        tracing::debug!(
            content = ?content.shape(),
            style = ?style.shape(),
            features = layer_names.len(),
            "built session"
        );

        Ok(Session {
            extractor,
            layer_names,
            normalization,
            content,
            style,
            content_layer,
            weights: LossWeights {
                content: params.content_weight,
                style: params.style_weights.clone(),
                tv: params.tv_weight,
            },
            style_layers,
            cancel: self.cancel,
            params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        fn check(name: &'static str, value: f32, min: f32, max: f32) -> Result<(), Error> {
            // NaN fails both comparisons
            if value >= min && value <= max {
                Ok(())
            } else {
                Err(Error::InvalidRange(errors::InvalidRange {
                    min,
                    max,
                    value,
                    name,
                }))
            }
        }

        let p = &self.params;

        check("output-size", p.output_size as f32, 1.0, 16384.0)?;
        if let Some(style_size) = p.style_size {
            check("style-size", style_size as f32, 1.0, 16384.0)?;
        }

        check("content-weight", p.content_weight, 0.0, f32::MAX)?;
        for weight in &p.style_weights {
            check("style-weight", *weight, 0.0, f32::MAX)?;
        }
        check("tv-weight", p.tv_weight, 0.0, f32::MAX)?;
        check("noise-std", p.noise_std, 0.0, f32::MAX)?;

        check("iterations", p.iterations as f32, 1.0, f32::MAX)?;
        check("learning-rate", p.learning_rate, f32::MIN_POSITIVE, f32::MAX)?;
        check("beta1", p.beta1, 0.0, 0.999_999)?;
        check("beta2", p.beta2, 0.0, 0.999_999)?;
        check("epsilon", p.epsilon, f32::MIN_POSITIVE, 1.0)?;
        check("progress-interval", p.progress_interval as f32, 1.0, f32::MAX)?;

        if let Some(max_count) = p.max_thread_count {
            check("max-thread-count", max_count as f32, 1.0, 1024.0)?;
        }

        Ok(())
    }
}

/// A reference to a feature layer, either by its position in the list of
/// feature maps or by the name of the layer producing it
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerRef {
    Index(usize),
    Name(String),
}

impl LayerRef {
    fn resolve(&self, layers: &LayerIndexMap) -> Result<usize, Error> {
        match self {
            Self::Index(index) if *index < layers.len() => Ok(*index),
            Self::Index(index) => Err(ConfigError::LayerOutOfRange {
                index: *index,
                available: layers.len(),
            }
            .into()),
            Self::Name(name) => layers
                .index_of(name)
                .ok_or_else(|| ConfigError::UnknownLayer(name.clone()).into()),
        }
    }
}

impl From<usize> for LayerRef {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for LayerRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<String> for LayerRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// Lets another thread stop a running session. The session finishes the
/// iteration it is in and returns the image as it is at that point.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The current state of the optimization
pub struct ProgressUpdate<'a> {
    /// The image tensor after `iteration` steps
    pub image: &'a ImageTensor,
    /// Needed to turn `image` back into a displayable image
    pub normalization: &'a Normalization,
    /// The number of iterations completed
    pub iteration: u32,
    /// The total number of iterations of the run
    pub total: u32,
    /// The loss of the last completed iteration
    pub loss: f32,
}

impl<'a> ProgressUpdate<'a> {
    /// Converts the current image tensor into a displayable image
    pub fn to_image(&self) -> Result<image::RgbImage, Error> {
        preprocess::postprocess(self.image, self.normalization)
    }
}

/// Allows the session to update external callers with the current
/// progress of the optimization
pub trait GeneratorProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> GeneratorProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Convolution, Layer, LayerOp};
    use ndarray::{Array1, Array4};

    fn tiny_model() -> Arc<Model> {
        let conv = Convolution::new(Array4::from_elem((3, 3, 3, 2), 0.05), Array1::zeros(2)).unwrap();
        Arc::new(Model::new(
            vec![
                Layer::new("conv1_1", LayerOp::Convolution(conv)),
                Layer::new("relu1_1", LayerOp::Activation),
            ],
            Normalization { mean: [0.5; 3] },
        ))
    }

    fn solid(color: [u8; 3]) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(8, 8, image::Rgb(color)))
    }

    fn builder<'a>() -> SessionBuilder<'a> {
        Session::builder()
            .content(solid([200, 10, 10]))
            .style(solid([10, 10, 200]))
            .model(tiny_model())
            .output_size(8)
            .content_layer(0usize)
            .style_layers(vec![1usize])
            .style_weights(vec![1.0])
            .iterations(3)
            .max_thread_count(1)
    }

    #[test]
    fn resolves_layers_by_name() {
        let session = builder()
            .content_layer("relu1_1")
            .style_layers(vec!["conv1_1"])
            .build()
            .unwrap();

        assert_eq!(session.content_layer, 1);
        assert_eq!(session.style_layers, vec![0]);
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(matches!(
            builder().content_layer(2usize).build(),
            Err(Error::Config(ConfigError::LayerOutOfRange { index: 2, available: 2 }))
        ));
        assert!(matches!(
            builder().style_layers(vec!["pool1"]).build(),
            Err(Error::Config(ConfigError::UnknownLayer(_)))
        ));
        assert!(matches!(
            builder().style_weights(vec![1.0, 2.0]).build(),
            Err(Error::Config(ConfigError::StyleWeightsMismatch {
                layers: 1,
                weights: 2
            }))
        ));
        assert!(matches!(
            builder().learning_rate(0.0).build(),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            builder().tv_weight(f32::NAN).build(),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            Session::builder().style(solid([0; 3])).model(tiny_model()).build(),
            Err(Error::MissingInput(_))
        ));
    }

    #[test]
    fn evaluate_checks_targets() {
        let session = builder().build().unwrap();
        let image = session.initial_image();

        let mut extra = session.targets().unwrap();
        extra.style_layers.push(0);
        extra.style_grams.push(extra.style_grams[0].clone());
        assert!(matches!(
            session.evaluate(&image, &extra),
            Err(Error::Config(ConfigError::StyleLengthMismatch {
                layers: 2,
                targets: 2,
                weights: 1
            }))
        ));

        let mut too_deep = session.targets().unwrap();
        too_deep.style_layers = vec![5];
        assert!(matches!(
            session.evaluate(&image, &too_deep),
            Err(Error::Config(ConfigError::LayerOutOfRange { index: 5, available: 2 }))
        ));

        let mut bad_content = session.targets().unwrap();
        bad_content.content_layer = 9;
        assert!(session.evaluate(&image, &bad_content).is_err());
    }

    #[test]
    fn noise_init_is_seeded() {
        let a = builder().init(Init::Noise).seed(7).build().unwrap();
        let b = builder().init(Init::Noise).seed(7).build().unwrap();
        let c = builder().init(Init::Noise).seed(8).build().unwrap();

        assert_eq!(a.initial_image(), b.initial_image());
        assert_ne!(a.initial_image(), c.initial_image());
    }

    #[test]
    fn reports_progress() {
        let session = builder().iterations(5).progress_interval(2).build().unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let generated = session
            .run(Some(Box::new(move |update: ProgressUpdate<'_>| {
                recorder.lock().unwrap().push((update.iteration, update.total));
            })))
            .unwrap();

        assert_eq!(generated.iterations(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![(2, 5), (4, 5), (5, 5)]);
    }

    #[test]
    fn cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();

        let generated = builder()
            .cancellation_token(token)
            .build()
            .unwrap()
            .run(None)
            .unwrap();

        assert!(generated.was_cancelled());
        assert!(generated.loss_history().is_empty());
    }
}
