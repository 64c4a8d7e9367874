use std::fmt;

use crate::ImageTensor;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

/// Two tensors that had to agree on their shape did not
#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) what: &'static str,
    pub(crate) expected: Vec<usize>,
    pub(crate) actual: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected shape {:?}, but got {:?}",
            self.what, self.expected, self.actual
        )
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// The style layer indices, target Gram matrices, and style weights are
    /// parallel sequences and must all be the same length
    StyleLengthMismatch {
        layers: usize,
        targets: usize,
        weights: usize,
    },
    /// A different number of style layers and style weights were configured
    StyleWeightsMismatch { layers: usize, weights: usize },
    /// A feature index beyond the features produced by the truncated network
    LayerOutOfRange { index: usize, available: usize },
    /// A layer name that is not part of the truncated network, or doesn't
    /// produce a feature map (eg. a pooling layer)
    UnknownLayer(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StyleLengthMismatch {
                layers,
                targets,
                weights,
            } => write!(
                f,
                "{} style layers, {} style targets and {} style weights were provided, they must be equal",
                layers, targets, weights
            ),
            Self::StyleWeightsMismatch { layers, weights } => write!(
                f,
                "{} style layers and {} style weights were configured, they must be equal",
                layers, weights
            ),
            Self::LayerOutOfRange { index, available } => write!(
                f,
                "feature layer {} was requested, but the network only produces {} feature maps",
                index, available
            ),
            Self::UnknownLayer(name) => {
                write!(f, "'{}' is not a feature layer of the network", name)
            }
        }
    }
}

#[derive(Debug)]
pub enum ModelLoadError {
    /// The model file isn't valid JSON, or doesn't match the expected schema
    Parse(serde_json::Error),
    /// The model has no `layers` list
    MissingLayers,
    /// A convolution or fully-connected layer has no `weights` field
    MissingWeights(String),
    /// A layer name with a prefix that doesn't map to a known layer kind
    UnknownLayerKind(String),
    /// The weights of a layer don't have the expected layout
    BadWeights { layer: String, reason: String },
    /// The per-channel average image is missing or malformed
    BadNormalization(String),
}

impl fmt::Display for ModelLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "failed to parse model: {}", err),
            Self::MissingLayers => write!(f, "model is missing the 'layers' key"),
            Self::MissingWeights(layer) => {
                write!(f, "layer '{}' is missing its 'weights' field", layer)
            }
            Self::UnknownLayerKind(layer) => {
                write!(f, "layer '{}' is not of a known kind", layer)
            }
            Self::BadWeights { layer, reason } => {
                write!(f, "layer '{}' has invalid weights: {}", layer, reason)
            }
            Self::BadNormalization(reason) => {
                write!(f, "model normalization metadata is invalid: {}", reason)
            }
        }
    }
}

/// The loss, its gradient, or an optimizer update stopped being finite
#[derive(Debug)]
pub struct NumericInstability {
    /// The iteration at which the non-finite value appeared
    pub iteration: u32,
    /// The last iteration that completed with finite values, if any did
    pub last_good_iteration: Option<u32>,
    /// What became non-finite
    pub quantity: &'static str,
    /// The image as it was after the last good iteration
    pub last_good_image: ImageTensor,
}

impl fmt::Display for NumericInstability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the {} became non-finite at iteration {}",
            self.quantity, self.iteration
        )?;

        match self.last_good_iteration {
            Some(good) => write!(f, ", last good iteration was {}", good),
            None => write!(f, ", before any iteration completed"),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The pretrained model file didn't match the expected schema
    ModelLoad(ModelLoadError),
    /// Tensors that are compared against each other had different shapes
    Shape(ShapeMismatch),
    /// The run configuration is inconsistent
    Config(ConfigError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// The optimization diverged, the run was aborted
    NumericInstability(Box<NumericInstability>),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
    /// A session was built without one of its required inputs
    MissingInput(&'static str),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::ModelLoad(ModelLoadError::Parse(err)) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Io(io) => write!(f, "{}", io),
            Self::ModelLoad(ml) => write!(f, "{}", ml),
            Self::Shape(sm) => write!(f, "{}", sm),
            Self::Config(ce) => write!(f, "{}", ce),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::NumericInstability(ni) => write!(f, "{}", ni),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
            Self::MissingInput(what) => write!(f, "no {} was provided", what),
        }
    }
}

impl Error {
    pub(crate) fn shape_mismatch(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::Shape(ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }

    pub(crate) fn bad_weights(layer: &str, reason: String) -> Self {
        Self::ModelLoad(ModelLoadError::BadWeights {
            layer: layer.to_owned(),
            reason,
        })
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<ModelLoadError> for Error {
    fn from(ml: ModelLoadError) -> Self {
        Self::ModelLoad(ml)
    }
}

impl From<ConfigError> for Error {
    fn from(ce: ConfigError) -> Self {
        Self::Config(ce)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ModelLoad(ModelLoadError::Parse(err))
    }
}
