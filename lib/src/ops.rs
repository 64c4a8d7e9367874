//! Forward and backward kernels for every layer kind.
//!
//! Backward passes only compute the gradient with respect to the layer input,
//! the network weights are constants.

use crate::{
    model::{Convolution, FullyConnected, LayerOp, Pooling},
    Error, FeatureMap,
};
use ndarray::{linalg::general_mat_mul, s, Array1, Array2, Array4, ArrayView2, Axis};

const PADDING: usize = 1;

/// Below this many rows a matrix product isn't worth fanning out
const MIN_ROWS_PER_WORKER: usize = 64;

/// Applies a single layer to `input`
pub(crate) fn forward(op: &LayerOp, input: &FeatureMap, threads: usize) -> Result<FeatureMap, Error> {
    match op {
        LayerOp::Convolution(conv) => conv_forward(conv, input, threads),
        LayerOp::Activation => Ok(input.mapv(|v| v.max(0.0))),
        LayerOp::Pooling(pool) => pool_forward(pool, input),
        LayerOp::FullyConnected(fc) => fc_forward(fc, input),
        LayerOp::Probability => Ok(softmax_forward(input)),
    }
}

/// Propagates `grad` (the gradient w.r.t. the layer output) back through a
/// layer, given the `input` and `output` recorded during the forward pass
pub(crate) fn backward(
    op: &LayerOp,
    grad: &FeatureMap,
    input: &FeatureMap,
    output: &FeatureMap,
    threads: usize,
) -> Result<FeatureMap, Error> {
    if grad.shape() != output.shape() {
        return Err(Error::shape_mismatch(
            "layer output gradient",
            output.shape(),
            grad.shape(),
        ));
    }

    match op {
        LayerOp::Convolution(conv) => conv_backward(conv, grad, input.dim(), threads),
        LayerOp::Activation => {
            let mut out = grad.clone();
            out.zip_mut_with(input, |g, &x| {
                if x <= 0.0 {
                    *g = 0.0;
                }
            });
            Ok(out)
        }
        LayerOp::Pooling(pool) => Ok(pool_backward(pool, grad, input.dim())),
        LayerOp::FullyConnected(fc) => Ok(fc_backward(fc, grad, input.dim())),
        LayerOp::Probability => Ok(softmax_backward(grad, output)),
    }
}

/// Computes `a * b`, splitting the rows of `a` across up to `threads` workers
pub(crate) fn matmul(a: ArrayView2<'_, f32>, b: ArrayView2<'_, f32>, threads: usize) -> Array2<f32> {
    let mut out = Array2::zeros((a.nrows(), b.ncols()));

    let workers = threads.min(a.nrows() / MIN_ROWS_PER_WORKER).max(1);

    // for WASM we do not have threads and crossbeam panics
    if workers == 1 || cfg!(target_arch = "wasm32") {
        general_mat_mul(1.0, &a, &b, 0.0, &mut out);
        return out;
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        let rows_per_worker = (a.nrows() + workers - 1) / workers;
        let b = &b;

        let result = crossbeam_utils::thread::scope(|scope| {
            for (a_rows, mut out_rows) in a
                .axis_chunks_iter(Axis(0), rows_per_worker)
                .zip(out.axis_chunks_iter_mut(Axis(0), rows_per_worker))
            {
                scope.spawn(move |_| general_mat_mul(1.0, &a_rows, b, 0.0, &mut out_rows));
            }
        });

        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }

    out
}

fn conv_output_dims(conv: &Convolution, height: usize, width: usize) -> Result<(usize, usize), Error> {
    let (kh, kw) = conv.kernel;
    let padded = (height + 2 * PADDING, width + 2 * PADDING);

    if padded.0 < kh || padded.1 < kw {
        return Err(Error::shape_mismatch(
            "convolution input is smaller than its kernel",
            &[kh.saturating_sub(2 * PADDING), kw.saturating_sub(2 * PADDING)],
            &[height, width],
        ));
    }

    Ok((padded.0 - kh + 1, padded.1 - kw + 1))
}

fn conv_forward(conv: &Convolution, input: &FeatureMap, threads: usize) -> Result<FeatureMap, Error> {
    let (height, width, channels, _) = input.dim();
    if channels != conv.in_channels {
        return Err(Error::shape_mismatch(
            "convolution input channels",
            &[conv.in_channels],
            &[channels],
        ));
    }

    let (out_h, out_w) = conv_output_dims(conv, height, width)?;
    let (kh, kw) = conv.kernel;

    // im2col, each row holds the receptive field of one output pixel
    let mut cols = Array2::<f32>::zeros((out_h * out_w, kh * kw * channels));
    for oy in 0..out_h {
        for ox in 0..out_w {
            let mut row = cols.row_mut(oy * out_w + ox);
            for ky in 0..kh {
                let iy = (oy + ky) as isize - PADDING as isize;
                if iy < 0 || iy >= height as isize {
                    continue;
                }
                for kx in 0..kw {
                    let ix = (ox + kx) as isize - PADDING as isize;
                    if ix < 0 || ix >= width as isize {
                        continue;
                    }
                    let offset = (ky * kw + kx) * channels;
                    row.slice_mut(s![offset..offset + channels])
                        .assign(&input.slice(s![iy as usize, ix as usize, .., 0]));
                }
            }
        }
    }

    let product = matmul(cols.view(), conv.weights.view(), threads);

    let mut out = Array4::from_shape_fn((out_h, out_w, conv.out_channels, 1), |(y, x, o, _)| {
        product[[y * out_w + x, o]]
    });
    out += &conv.bias;

    Ok(out)
}

fn conv_backward(
    conv: &Convolution,
    grad: &FeatureMap,
    input_dim: (usize, usize, usize, usize),
    threads: usize,
) -> Result<FeatureMap, Error> {
    let (height, width, channels, batch) = input_dim;
    let (out_h, out_w, out_c, _) = grad.dim();
    let (kh, kw) = conv.kernel;

    let grad_rows = Array2::from_shape_fn((out_h * out_w, out_c), |(r, o)| {
        grad[[r / out_w, r % out_w, o, 0]]
    });
    let grad_cols = matmul(grad_rows.view(), conv.weights.t(), threads);

    // col2im, the transpose of the gather done in the forward pass
    let mut grad_input = Array4::<f32>::zeros((height, width, channels, batch));
    for oy in 0..out_h {
        for ox in 0..out_w {
            let row = grad_cols.row(oy * out_w + ox);
            for ky in 0..kh {
                let iy = (oy + ky) as isize - PADDING as isize;
                if iy < 0 || iy >= height as isize {
                    continue;
                }
                for kx in 0..kw {
                    let ix = (ox + kx) as isize - PADDING as isize;
                    if ix < 0 || ix >= width as isize {
                        continue;
                    }
                    let offset = (ky * kw + kx) * channels;
                    let mut dst = grad_input.slice_mut(s![iy as usize, ix as usize, .., 0]);
                    dst += &row.slice(s![offset..offset + channels]);
                }
            }
        }
    }

    Ok(grad_input)
}

fn pool_forward(pool: &Pooling, input: &FeatureMap) -> Result<FeatureMap, Error> {
    let (height, width, channels, batch) = input.dim();
    let (ph, pw) = pool.window;
    let (sh, sw) = pool.stride;

    if height < ph || width < pw {
        return Err(Error::shape_mismatch(
            "pooling input is smaller than its window",
            &[ph, pw],
            &[height, width],
        ));
    }

    let out_h = (height - ph) / sh + 1;
    let out_w = (width - pw) / sw + 1;
    let norm = 1.0 / (ph * pw) as f32;

    Ok(Array4::from_shape_fn(
        (out_h, out_w, channels, batch),
        |(y, x, c, b)| {
            input
                .slice(s![y * sh..y * sh + ph, x * sw..x * sw + pw, c, b])
                .sum()
                * norm
        },
    ))
}

fn pool_backward(pool: &Pooling, grad: &FeatureMap, input_dim: (usize, usize, usize, usize)) -> FeatureMap {
    let (ph, pw) = pool.window;
    let (sh, sw) = pool.stride;
    let norm = 1.0 / (ph * pw) as f32;

    let mut grad_input = Array4::<f32>::zeros(input_dim);
    for ((y, x, c, b), g) in grad.indexed_iter() {
        grad_input
            .slice_mut(s![y * sh..y * sh + ph, x * sw..x * sw + pw, c, b])
            .map_inplace(|v| *v += g * norm);
    }

    grad_input
}

fn fc_forward(fc: &FullyConnected, input: &FeatureMap) -> Result<FeatureMap, Error> {
    if input.len() != fc.in_features() {
        return Err(Error::shape_mismatch(
            "fully-connected input",
            &[fc.in_features()],
            &[input.len()],
        ));
    }

    let flat: Array1<f32> = input.iter().copied().collect();
    let out = fc.weights.dot(&flat) + &fc.bias;

    Ok(Array4::from_shape_fn((1, 1, out.len(), 1), |(_, _, o, _)| {
        out[o]
    }))
}

fn fc_backward(fc: &FullyConnected, grad: &FeatureMap, input_dim: (usize, usize, usize, usize)) -> FeatureMap {
    let flat: Array1<f32> = grad.iter().copied().collect();
    let grad_flat = fc.weights.t().dot(&flat);

    let (_, width, channels, batch) = input_dim;
    Array4::from_shape_fn(input_dim, |(y, x, c, b)| {
        grad_flat[((y * width + x) * channels + c) * batch + b]
    })
}

/// Softmax over the channel axis of every spatial position
fn softmax_forward(input: &FeatureMap) -> FeatureMap {
    let mut out = input.clone();
    for mut lane in out.lanes_mut(Axis(2)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    out
}

fn softmax_backward(grad: &FeatureMap, output: &FeatureMap) -> FeatureMap {
    let mut grad_input = grad.clone();
    for (mut g, s) in grad_input
        .lanes_mut(Axis(2))
        .into_iter()
        .zip(output.lanes(Axis(2)))
    {
        let dot = g.dot(&s);
        g.zip_mut_with(&s, |g, &s| *g = s * (*g - dot));
    }
    grad_input
}
