//! Content, style, and total-variation losses.
//!
//! Every loss has a `_grad` companion returning the loss together with its
//! gradient w.r.t. the feature map (or image) it was computed from.

use crate::{errors::ConfigError, Error, FeatureMap, ImageTensor};
use ndarray::{s, Array2, Array4};

/// The weights of the loss terms, fixed for the duration of a run
#[derive(Clone, Debug, PartialEq)]
pub struct LossWeights {
    pub content: f32,
    /// One weight per style layer
    pub style: Vec<f32>,
    pub tv: f32,
}

/// The content features and style Gram matrices the generated image is
/// optimized towards, computed once before optimization starts
#[derive(Clone, Debug)]
pub struct LossTargets {
    pub content_layer: usize,
    pub content: FeatureMap,
    pub style_layers: Vec<usize>,
    pub style_grams: Vec<Array2<f32>>,
}

fn element_count(map: &FeatureMap) -> f32 {
    let (h, w, c, _) = map.dim();
    (h * w * c) as f32
}

fn check_same_shape(what: &'static str, current: &FeatureMap, target: &FeatureMap) -> Result<(), Error> {
    if current.shape() != target.shape() {
        return Err(Error::shape_mismatch(what, target.shape(), current.shape()));
    }
    Ok(())
}

/// Squared error between two feature maps, normalized by `4 * H * W * C`
pub fn content_loss(weight: f32, current: &FeatureMap, target: &FeatureMap) -> Result<f32, Error> {
    check_same_shape("content features", current, target)?;

    let sum: f32 = current
        .iter()
        .zip(target.iter())
        .map(|(c, t)| (c - t) * (c - t))
        .sum();

    Ok(weight * sum / (4.0 * element_count(current)))
}

pub(crate) fn content_loss_grad(
    weight: f32,
    current: &FeatureMap,
    target: &FeatureMap,
) -> Result<(f32, FeatureMap), Error> {
    let loss = content_loss(weight, current, target)?;
    let scale = weight * 2.0 / (4.0 * element_count(current));
    let grad = (current - target) * scale;
    Ok((loss, grad))
}

/// Flattens a `(H, W, C, 1)` feature map into a `(H * W, C)` matrix
fn flatten(features: &FeatureMap) -> Array2<f32> {
    let (_, w, c, _) = features.dim();
    let rows = features.len() / c.max(1);
    Array2::from_shape_fn((rows, c), |(r, ch)| features[[r / w, r % w, ch, 0]])
}

fn gram_scale(features: &FeatureMap, normalize: bool) -> f32 {
    if normalize {
        1.0 / (2.0 * element_count(features))
    } else {
        1.0
    }
}

/// The `C x C` matrix of channel correlations of a feature map. When
/// `normalize` is set every entry is divided by `2 * H * W * C`.
pub fn gram_matrix(features: &FeatureMap, normalize: bool) -> Array2<f32> {
    let flat = flatten(features);
    let gram = flat.t().dot(&flat);
    gram * gram_scale(features, normalize)
}

pub(crate) fn check_style_lengths(layers: usize, targets: usize, weights: usize) -> Result<(), Error> {
    if layers != targets || layers != weights {
        return Err(ConfigError::StyleLengthMismatch {
            layers,
            targets,
            weights,
        }
        .into());
    }
    Ok(())
}

fn style_feature<'f>(features: &'f [FeatureMap], layer: usize) -> Result<&'f FeatureMap, Error> {
    features.get(layer).ok_or_else(|| {
        ConfigError::LayerOutOfRange {
            index: layer,
            available: features.len(),
        }
        .into()
    })
}

fn layer_style_loss(current: &FeatureMap, target: &Array2<f32>, weight: f32) -> Result<(f32, Array2<f32>), Error> {
    let gram = gram_matrix(current, true);
    if gram.shape() != target.shape() {
        return Err(Error::shape_mismatch(
            "style Gram matrix",
            target.shape(),
            gram.shape(),
        ));
    }

    let diff = gram - target;
    let loss = weight * diff.iter().map(|d| d * d).sum::<f32>();
    Ok((loss, diff))
}

/// Weighted sum over layers of the squared difference between the Gram
/// matrix of the current features and the target Gram matrix
pub fn style_loss(
    features: &[FeatureMap],
    style_layers: &[usize],
    targets: &[Array2<f32>],
    weights: &[f32],
) -> Result<f32, Error> {
    check_style_lengths(style_layers.len(), targets.len(), weights.len())?;

    let mut total = 0.0;
    for ((&layer, target), &weight) in style_layers.iter().zip(targets).zip(weights) {
        let current = style_feature(features, layer)?;
        total += layer_style_loss(current, target, weight)?.0;
    }

    Ok(total)
}

/// Style loss of a single layer with the gradient w.r.t. that layer's features
pub(crate) fn layer_style_loss_grad(
    current: &FeatureMap,
    target: &Array2<f32>,
    weight: f32,
) -> Result<(f32, FeatureMap), Error> {
    let (loss, diff) = layer_style_loss(current, target, weight)?;

    // d/dF of w * |s F^T F - A|^2 with a symmetric difference
    let flat = flatten(current);
    let scale = 4.0 * gram_scale(current, true) * weight;
    let grad_flat = flat.dot(&diff) * scale;

    let (_, w, _, _) = current.dim();
    let grad = Array4::from_shape_fn(current.raw_dim(), |(y, x, c, _)| grad_flat[[y * w + x, c]]);

    Ok((loss, grad))
}

/// Squared differences between vertically and horizontally adjacent pixels,
/// normalized by `4 * H * W * C`
pub fn tv_loss(image: &ImageTensor, weight: f32) -> f32 {
    tv_loss_grad(image, weight).0
}

pub(crate) fn tv_loss_grad(image: &ImageTensor, weight: f32) -> (f32, ImageTensor) {
    let scale = weight / (4.0 * element_count(image));
    let mut grad = Array4::zeros(image.raw_dim());

    let vertical = &image.slice(s![1.., .., .., ..]) - &image.slice(s![..-1, .., .., ..]);
    let horizontal = &image.slice(s![.., 1.., .., ..]) - &image.slice(s![.., ..-1, .., ..]);

    let sum = vertical.iter().map(|d| d * d).sum::<f32>()
        + horizontal.iter().map(|d| d * d).sum::<f32>();

    grad.slice_mut(s![1.., .., .., ..])
        .scaled_add(2.0 * scale, &vertical);
    grad.slice_mut(s![..-1, .., .., ..])
        .scaled_add(-2.0 * scale, &vertical);
    grad.slice_mut(s![.., 1.., .., ..])
        .scaled_add(2.0 * scale, &horizontal);
    grad.slice_mut(s![.., ..-1, .., ..])
        .scaled_add(-2.0 * scale, &horizontal);

    (sum * scale, grad)
}

/// The sum of the content, style, and total-variation losses
pub fn total_loss(
    features: &[FeatureMap],
    image: &ImageTensor,
    targets: &LossTargets,
    weights: &LossWeights,
) -> Result<f32, Error> {
    let content = style_feature(features, targets.content_layer)?;

    Ok(content_loss(weights.content, content, &targets.content)?
        + style_loss(
            features,
            &targets.style_layers,
            &targets.style_grams,
            &weights.style,
        )?
        + tv_loss(image, weights.tv))
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array;

    fn ramp(shape: (usize, usize, usize, usize)) -> FeatureMap {
        Array::from_shape_fn(shape, |(y, x, c, _)| {
            ((y * 7 + x * 3 + c * 5) % 11) as f32 * 0.1 - 0.4
        })
    }

    #[test]
    fn content_of_self_is_zero() {
        let x = ramp((5, 4, 3, 1));
        assert_eq!(content_loss(10.0, &x, &x).unwrap(), 0.0);
    }

    #[test]
    fn content_normalization() {
        let x = Array4::zeros((2, 2, 1, 1));
        let t = Array4::from_elem((2, 2, 1, 1), 1.0);
        // 4 squared errors of 1, over 4 * 4 elements
        assert!((content_loss(2.0, &x, &t).unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn content_shape_mismatch() {
        let x = Array4::zeros((2, 2, 3, 1));
        let t = Array4::zeros((2, 3, 3, 1));
        assert!(matches!(content_loss(1.0, &x, &t), Err(Error::Shape(_))));
    }

    #[test]
    fn gram_is_symmetric() {
        let gram = gram_matrix(&ramp((6, 5, 4, 1)), true);
        assert_eq!(gram.shape(), &[4, 4]);

        for i in 0..4 {
            for j in 0..4 {
                assert!((gram[[i, j]] - gram[[j, i]]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn gram_normalization() {
        let features = Array4::from_elem((2, 1, 2, 1), 1.0);
        let raw = gram_matrix(&features, false);
        assert_eq!(raw, Array2::from_elem((2, 2), 2.0));

        let normalized = gram_matrix(&features, true);
        assert_eq!(normalized, Array2::from_elem((2, 2), 0.25));
    }

    #[test]
    fn style_length_mismatch() {
        let features = vec![ramp((3, 3, 2, 1))];
        let target = gram_matrix(&features[0], true);

        match style_loss(&features, &[0], &[target], &[1.0, 2.0]) {
            Err(Error::Config(ConfigError::StyleLengthMismatch { weights: 2, .. })) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn style_is_permutation_invariant() {
        let features = vec![ramp((4, 4, 2, 1)), ramp((2, 2, 3, 1)), ramp((3, 2, 5, 1))];
        let targets: Vec<_> = features
            .iter()
            .map(|f| gram_matrix(&(f * 0.5), true))
            .collect();

        let forward = style_loss(
            &features,
            &[0, 1, 2],
            &[targets[0].clone(), targets[1].clone(), targets[2].clone()],
            &[1.0, 2.0, 3.0],
        )
        .unwrap();
        let shuffled = style_loss(
            &features,
            &[2, 0, 1],
            &[targets[2].clone(), targets[0].clone(), targets[1].clone()],
            &[3.0, 1.0, 2.0],
        )
        .unwrap();

        assert!(forward > 0.0);
        assert!((forward - shuffled).abs() <= forward * 1e-5);
    }

    #[test]
    fn tv_of_constant_is_zero() {
        let image = Array4::from_elem((7, 5, 3, 1), 0.3);
        let (loss, grad) = tv_loss_grad(&image, 100.0);
        assert_eq!(loss, 0.0);
        assert!(grad.iter().all(|g| *g == 0.0));
    }

    #[test]
    fn tv_single_edge() {
        // one vertical step of 1 between the two rows of a 2x1 single channel image
        let image = Array::from_shape_vec((2, 1, 1, 1), vec![0.0, 1.0]).unwrap();
        let (loss, grad) = tv_loss_grad(&image, 8.0);

        assert!((loss - 1.0).abs() < 1e-6);
        assert!((grad[[0, 0, 0, 0]] + 2.0).abs() < 1e-6);
        assert!((grad[[1, 0, 0, 0]] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn style_grad_matches_finite_difference() {
        let current = ramp((3, 3, 2, 1));
        let target = gram_matrix(&(&current * 0.25), true);
        let (_, grad) = layer_style_loss_grad(&current, &target, 10.0).unwrap();

        let h = 1e-2;
        let idx = [1, 2, 1, 0];
        let mut plus = current.clone();
        plus[idx] += h;
        let mut minus = current.clone();
        minus[idx] -= h;

        let numeric = (layer_style_loss(&plus, &target, 10.0).unwrap().0
            - layer_style_loss(&minus, &target, 10.0).unwrap().0)
            / (2.0 * h);

        assert!(
            (numeric - grad[idx]).abs() <= 1e-2 * grad[idx].abs().max(1e-3),
            "numeric {} analytic {}",
            numeric,
            grad[idx]
        );
    }
}
