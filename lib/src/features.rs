use crate::{model::Model, ops, Error, FeatureMap, ImageTensor};
use ndarray::Array4;
use std::{collections::HashMap, sync::Arc};

/// Maps the names of the layers that produce feature maps to their position
/// in the list of features returned by [`FeatureExtractor::extract`]
#[derive(Clone, Debug, Default)]
pub struct LayerIndexMap {
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl LayerIndexMap {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Feature layer names in execution order
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.names.iter().map(String::as_str)
    }
}

/// A pretrained network truncated at a given layer, used as a pure function
/// from an image tensor to the feature maps of every convolution and
/// activation layer.
#[derive(Clone)]
pub struct FeatureExtractor {
    model: Arc<Model>,
    /// Number of layers of the model that are applied
    depth: usize,
    /// For every feature, the index of the layer that produces it
    feature_layers: Vec<usize>,
    max_thread_count: usize,
}

/// Builds the feature function for `model`, applying every layer up to (but
/// not including) the first layer whose name starts with `truncate_at`. An
/// empty `truncate_at` keeps the whole network.
pub fn build_feature_function(
    model: Arc<Model>,
    truncate_at: &str,
) -> (FeatureExtractor, LayerIndexMap) {
    let depth = if truncate_at.is_empty() {
        model.layers().len()
    } else {
        model
            .layers()
            .iter()
            .position(|layer| layer.name().starts_with(truncate_at))
            .unwrap_or_else(|| model.layers().len())
    };

    let mut index_map = LayerIndexMap::default();
    let mut feature_layers = Vec::new();

    for (i, layer) in model.layers()[..depth].iter().enumerate() {
        if layer.kind().produces_feature() {
            index_map
                .by_name
                .insert(layer.name().to_owned(), feature_layers.len());
            index_map.names.push(layer.name().to_owned());
            feature_layers.push(i);
        }
    }

    tracing::debug!(
        layers = depth,
        features = feature_layers.len(),
        truncate_at,
        "built feature function"
    );

    (
        FeatureExtractor {
            model,
            depth,
            feature_layers,
            max_thread_count: num_cpus::get(),
        },
        index_map,
    )
}

/// The activations recorded during a forward pass, kept around so the pass
/// can be differentiated
pub(crate) struct Trace {
    /// `activations[0]` is the input image, `activations[l + 1]` is the output
    /// of layer `l`
    activations: Vec<FeatureMap>,
}

impl FeatureExtractor {
    /// Limits the number of worker threads used for the heavy matrix products
    pub fn with_max_thread_count(mut self, count: usize) -> Self {
        self.max_thread_count = count.max(1);
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The number of feature maps produced by [`Self::extract`]
    pub fn feature_count(&self) -> usize {
        self.feature_layers.len()
    }

    /// Runs the truncated network on `image`, returning the output of every
    /// convolution and activation layer in execution order
    pub fn extract(&self, image: &ImageTensor) -> Result<Vec<FeatureMap>, Error> {
        let trace = self.trace(image, self.depth)?;
        Ok(self
            .feature_layers
            .iter()
            .map(|&layer| trace.activations[layer + 1].clone())
            .collect())
    }

    /// The feature map at `index` of the trace, which must have been run at
    /// least that deep
    pub(crate) fn feature<'t>(&self, trace: &'t Trace, index: usize) -> Result<&'t FeatureMap, Error> {
        self.feature_layers
            .get(index)
            .and_then(|layer| trace.activations.get(layer + 1))
            .ok_or_else(|| {
                crate::errors::ConfigError::LayerOutOfRange {
                    index,
                    available: self.feature_layers.len(),
                }
                .into()
            })
    }

    /// Runs the network only as deep as needed to produce feature `deepest`
    pub(crate) fn forward(&self, image: &ImageTensor, deepest: usize) -> Result<Trace, Error> {
        let depth = self
            .feature_layers
            .get(deepest)
            .map(|layer| layer + 1)
            .ok_or(crate::errors::ConfigError::LayerOutOfRange {
                index: deepest,
                available: self.feature_layers.len(),
            })?;

        self.trace(image, depth)
    }

    fn trace(&self, image: &ImageTensor, depth: usize) -> Result<Trace, Error> {
        let mut activations = Vec::with_capacity(depth + 1);
        activations.push(image.clone());

        for layer in &self.model.layers()[..depth] {
            let input = &activations[activations.len() - 1];
            let output = ops::forward(layer.op(), input, self.max_thread_count)?;
            activations.push(output);
        }

        Ok(Trace { activations })
    }

    /// Back-propagates per-feature loss gradients through a recorded forward
    /// pass, returning the gradient w.r.t. the input image
    pub(crate) fn backward(
        &self,
        trace: &Trace,
        feature_grads: Vec<(usize, FeatureMap)>,
    ) -> Result<ImageTensor, Error> {
        let recorded = trace.activations.len() - 1;
        let mut pending: Vec<Option<FeatureMap>> = vec![None; recorded];

        for (feature, grad) in feature_grads {
            let layer = match self.feature_layers.get(feature) {
                Some(&layer) if layer < recorded => layer,
                _ => {
                    return Err(crate::errors::ConfigError::LayerOutOfRange {
                        index: feature,
                        available: self.feature_layers.len(),
                    }
                    .into())
                }
            };

            pending[layer] = Some(match pending[layer].take() {
                Some(existing) => existing + &grad,
                None => grad,
            });
        }

        let deepest = match pending.iter().rposition(Option::is_some) {
            Some(deepest) => deepest,
            None => return Ok(Array4::zeros(trace.activations[0].raw_dim())),
        };

        let mut grad: Option<FeatureMap> = None;
        for layer in (0..=deepest).rev() {
            let output = &trace.activations[layer + 1];

            let upstream = match (grad.take(), pending[layer].take()) {
                (Some(g), Some(p)) => g + &p,
                (Some(g), None) => g,
                (None, Some(p)) => p,
                (None, None) => Array4::zeros(output.raw_dim()),
            };

            grad = Some(ops::backward(
                self.model.layers()[layer].op(),
                &upstream,
                &trace.activations[layer],
                output,
                self.max_thread_count,
            )?);
        }

        Ok(grad.unwrap_or_else(|| Array4::zeros(trace.activations[0].raw_dim())))
    }
}
