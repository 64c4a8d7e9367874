//! Pretrained network weights.
//!
//! A model file lists the layers of the network in execution order. The kind
//! of each layer is decided once, from its name prefix, when the file is
//! parsed, after which the forward pass only ever matches on [`LayerOp`].

use crate::{errors::ModelLoadError, Error, Normalization};
use ndarray::{Array1, Array2, Array4};
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Convolution,
    Activation,
    Pooling,
    FullyConnected,
    Probability,
}

impl LayerKind {
    /// Classifies a layer by the prefix of its name, eg. `conv3_1` or `relu3_1`
    pub fn from_name(name: &str) -> Option<Self> {
        const PREFIXES: [(&str, LayerKind); 5] = [
            ("conv", LayerKind::Convolution),
            ("relu", LayerKind::Activation),
            ("pool", LayerKind::Pooling),
            ("fc", LayerKind::FullyConnected),
            ("prob", LayerKind::Probability),
        ];

        PREFIXES
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix))
            .map(|(_, kind)| *kind)
    }

    /// Whether the output of this kind of layer is recorded as a feature map
    pub fn produces_feature(self) -> bool {
        matches!(self, Self::Convolution | Self::Activation)
    }
}

/// A 2D convolution with stride 1 and a zero padding of 1 pixel
#[derive(Clone, Debug)]
pub struct Convolution {
    pub(crate) kernel: (usize, usize),
    pub(crate) in_channels: usize,
    pub(crate) out_channels: usize,
    /// Filters flattened to `(kh * kw * in, out)`, matching the im2col layout
    pub(crate) weights: Array2<f32>,
    /// Bias reshaped to `(1, 1, out, 1)` so it broadcasts over a feature map
    pub(crate) bias: Array4<f32>,
}

impl Convolution {
    /// Creates a convolution from filters laid out `(kh, kw, in, out)`
    pub fn new(filters: Array4<f32>, bias: Array1<f32>) -> Result<Self, Error> {
        let (kh, kw, in_channels, out_channels) = filters.dim();

        if bias.len() != out_channels {
            return Err(Error::shape_mismatch(
                "convolution bias",
                &[out_channels],
                &[bias.len()],
            ));
        }

        let weights = Array2::from_shape_fn((kh * kw * in_channels, out_channels), |(r, o)| {
            let ky = r / (kw * in_channels);
            let kx = (r / in_channels) % kw;
            filters[[ky, kx, r % in_channels, o]]
        });
        let bias = Array4::from_shape_fn((1, 1, out_channels, 1), |(_, _, o, _)| bias[o]);

        Ok(Self {
            kernel: (kh, kw),
            in_channels,
            out_channels,
            weights,
            bias,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

/// Average pooling
#[derive(Clone, Copy, Debug)]
pub struct Pooling {
    pub(crate) window: (usize, usize),
    pub(crate) stride: (usize, usize),
}

impl Pooling {
    pub fn new(window: (usize, usize), stride: (usize, usize)) -> Self {
        Self { window, stride }
    }
}

impl Default for Pooling {
    fn default() -> Self {
        Self::new((2, 2), (2, 2))
    }
}

#[derive(Clone, Debug)]
pub struct FullyConnected {
    /// Transposed to `(out, in)` so the forward pass is a plain `W x`
    pub(crate) weights: Array2<f32>,
    pub(crate) bias: Array1<f32>,
}

impl FullyConnected {
    /// Creates a fully-connected layer from weights laid out `(in, out)`
    pub fn new(weights: Array2<f32>, bias: Array1<f32>) -> Result<Self, Error> {
        if bias.len() != weights.ncols() {
            return Err(Error::shape_mismatch(
                "fully-connected bias",
                &[weights.ncols()],
                &[bias.len()],
            ));
        }

        Ok(Self {
            weights: weights.reversed_axes().as_standard_layout().into_owned(),
            bias,
        })
    }

    pub fn in_features(&self) -> usize {
        self.weights.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weights.nrows()
    }
}

/// The operation and parameters of a single layer
#[derive(Clone, Debug)]
pub enum LayerOp {
    Convolution(Convolution),
    Activation,
    Pooling(Pooling),
    FullyConnected(FullyConnected),
    Probability,
}

#[derive(Clone, Debug)]
pub struct Layer {
    pub(crate) name: String,
    pub(crate) op: LayerOp,
}

impl Layer {
    pub fn new<S: Into<String>>(name: S, op: LayerOp) -> Self {
        Self {
            name: name.into(),
            op,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &LayerOp {
        &self.op
    }

    pub fn kind(&self) -> LayerKind {
        match self.op {
            LayerOp::Convolution(_) => LayerKind::Convolution,
            LayerOp::Activation => LayerKind::Activation,
            LayerOp::Pooling(_) => LayerKind::Pooling,
            LayerOp::FullyConnected(_) => LayerKind::FullyConnected,
            LayerOp::Probability => LayerKind::Probability,
        }
    }
}

/// A pretrained network, consumed read-only as a feature function
#[derive(Clone, Debug)]
pub struct Model {
    layers: Vec<Layer>,
    normalization: Normalization,
}

#[derive(Deserialize)]
struct RawModel {
    layers: Option<Vec<RawLayer>>,
    meta: Option<RawMeta>,
}

#[derive(Deserialize)]
struct RawLayer {
    name: String,
    weights: Option<Vec<RawArray>>,
    pool: Option<[usize; 2]>,
    stride: Option<[usize; 2]>,
}

#[derive(Deserialize)]
struct RawArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Deserialize)]
struct RawMeta {
    normalization: Option<RawNormalization>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNormalization {
    average_image: Vec<f32>,
}

impl Model {
    pub fn new(layers: Vec<Layer>, normalization: Normalization) -> Self {
        Self {
            layers,
            normalization,
        }
    }

    /// Loads a model from a JSON model file on disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self, Error> {
        let raw: RawModel = serde_json::from_reader(reader)?;
        Self::from_raw(raw)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        let raw: RawModel = serde_json::from_slice(data)?;
        Self::from_raw(raw)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    fn from_raw(raw: RawModel) -> Result<Self, Error> {
        let raw_layers = raw.layers.ok_or(ModelLoadError::MissingLayers)?;

        let normalization = raw
            .meta
            .and_then(|meta| meta.normalization)
            .ok_or_else(|| ModelLoadError::BadNormalization("no average image".to_owned()))?;
        let normalization = parse_average_image(&normalization.average_image)?;

        // The channel count flowing out of the previous parameterized layer
        let mut channels: Option<usize> = None;
        let mut layers = Vec::with_capacity(raw_layers.len());

        for raw_layer in raw_layers {
            let kind = LayerKind::from_name(&raw_layer.name)
                .ok_or_else(|| ModelLoadError::UnknownLayerKind(raw_layer.name.clone()))?;

            let op = match kind {
                LayerKind::Convolution => {
                    let conv = parse_convolution(&raw_layer)?;
                    if let Some(expected) = channels {
                        if conv.in_channels != expected {
                            return Err(Error::bad_weights(
                                &raw_layer.name,
                                format!(
                                    "filters expect {} input channels, but the previous layer produces {}",
                                    conv.in_channels, expected
                                ),
                            ));
                        }
                    }
                    channels = Some(conv.out_channels);
                    LayerOp::Convolution(conv)
                }
                LayerKind::FullyConnected => {
                    let fc = parse_fully_connected(&raw_layer)?;
                    channels = Some(fc.out_features());
                    LayerOp::FullyConnected(fc)
                }
                LayerKind::Pooling => {
                    let window = raw_layer.pool.unwrap_or([2, 2]);
                    let stride = raw_layer.stride.unwrap_or(window);
                    if window.contains(&0) || stride.contains(&0) {
                        return Err(Error::bad_weights(
                            &raw_layer.name,
                            "pooling window and stride must be non-zero".to_owned(),
                        ));
                    }
                    LayerOp::Pooling(Pooling::new(
                        (window[0], window[1]),
                        (stride[0], stride[1]),
                    ))
                }
                LayerKind::Activation => LayerOp::Activation,
                LayerKind::Probability => LayerOp::Probability,
            };

            layers.push(Layer {
                name: raw_layer.name,
                op,
            });
        }

        tracing::debug!(layers = layers.len(), "parsed model");

        Ok(Self::new(layers, normalization))
    }
}

/// The average image is either a single RGB triple, or a full channel-last
/// image, in which case it is averaged per channel
fn parse_average_image(average: &[f32]) -> Result<Normalization, Error> {
    if average.is_empty() || average.len() % 3 != 0 {
        return Err(ModelLoadError::BadNormalization(format!(
            "expected a multiple of 3 channel values, found {}",
            average.len()
        ))
        .into());
    }

    let mut mean = [0.0f32; 3];
    for pixel in average.chunks(3) {
        for c in 0..3 {
            mean[c] += pixel[c];
        }
    }

    let count = (average.len() / 3) as f32;
    for m in mean.iter_mut() {
        *m /= count;
    }

    Ok(Normalization::from_mean(mean))
}

fn layer_weights<'a>(
    layer: &'a RawLayer,
    expected: usize,
) -> Result<&'a [RawArray], Error> {
    let weights = layer
        .weights
        .as_ref()
        .ok_or_else(|| ModelLoadError::MissingWeights(layer.name.clone()))?;

    if weights.len() != expected {
        return Err(Error::bad_weights(
            &layer.name,
            format!("expected {} weight arrays, found {}", expected, weights.len()),
        ));
    }

    for array in weights {
        let len: usize = array.shape.iter().product();
        if len != array.data.len() {
            return Err(Error::bad_weights(
                &layer.name,
                format!(
                    "shape {:?} holds {} values, but {} were provided",
                    array.shape,
                    len,
                    array.data.len()
                ),
            ));
        }
    }

    Ok(weights.as_slice())
}

fn parse_convolution(layer: &RawLayer) -> Result<Convolution, Error> {
    let weights = layer_weights(layer, 2)?;
    let (filters, bias) = (&weights[0], &weights[1]);

    let shape = match filters.shape.as_slice() {
        [kh, kw, cin, cout] => (*kh, *kw, *cin, *cout),
        // Trailing singleton output dimensions are commonly squeezed away
        [kh, kw, cin] => (*kh, *kw, *cin, 1),
        other => {
            return Err(Error::bad_weights(
                &layer.name,
                format!("convolution filters must have 4 dimensions, found {:?}", other),
            ))
        }
    };

    let filters = Array4::from_shape_vec(shape, filters.data.clone())
        .map_err(|err| Error::bad_weights(&layer.name, err.to_string()))?;

    Convolution::new(filters, Array1::from(bias.data.clone())).map_err(|err| match err {
        Error::Shape(sm) => Error::bad_weights(&layer.name, sm.to_string()),
        other => other,
    })
}

fn parse_fully_connected(layer: &RawLayer) -> Result<FullyConnected, Error> {
    let weights = layer_weights(layer, 2)?;
    let (matrix, bias) = (&weights[0], &weights[1]);

    let out_features = match matrix.shape.last() {
        Some(out) if *out > 0 => *out,
        _ => {
            return Err(Error::bad_weights(
                &layer.name,
                "fully-connected weights have no output dimension".to_owned(),
            ))
        }
    };
    let in_features = matrix.data.len() / out_features;

    let matrix = Array2::from_shape_vec((in_features, out_features), matrix.data.clone())
        .map_err(|err| Error::bad_weights(&layer.name, err.to_string()))?;

    FullyConnected::new(matrix, Array1::from(bias.data.clone())).map_err(|err| match err {
        Error::Shape(sm) => Error::bad_weights(&layer.name, sm.to_string()),
        other => other,
    })
}

type ModelSlot = Arc<Mutex<Option<Arc<Model>>>>;

/// A cache of loaded models, keyed by a model identifier (typically its path).
///
/// Models are loaded lazily on first request and then shared read-only for
/// as long as the cache lives. Concurrent requests for the same identifier
/// wait on each other, so a model is never parsed twice.
#[derive(Default)]
pub struct ModelCache {
    slots: Mutex<HashMap<String, ModelSlot>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the model for `id`, calling `load` to populate the cache if it
    /// isn't present yet. A failed load leaves the entry empty.
    pub fn get_or_load<F>(&self, id: &str, load: F) -> Result<Arc<Model>, Error>
    where
        F: FnOnce() -> Result<Model, Error>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(id.to_owned()).or_default())
        };

        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = slot.as_ref() {
            tracing::debug!(model = id, "model cache hit");
            return Ok(Arc::clone(model));
        }

        tracing::debug!(model = id, "loading model");
        let model = Arc::new(load()?);
        *slot = Some(Arc::clone(&model));

        Ok(model)
    }

    /// Gets the model stored at `path`, loading it on first use
    pub fn load_path<P: AsRef<Path>>(&self, path: P) -> Result<Arc<Model>, Error> {
        let path = path.as_ref();
        self.get_or_load(&path.to_string_lossy(), || Model::load(path))
    }

    /// Whether a model has been successfully loaded for `id`
    pub fn contains(&self, id: &str) -> bool {
        let slot = match self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };

        let loaded = slot.lock().unwrap_or_else(PoisonError::into_inner).is_some();
        loaded
    }
}
