//! Conversion between raster images and mean-centered network input tensors.
//!
//! Tensors are laid out `(height, width, channel, batch)` with a batch of 1,
//! matching the feature maps produced by the network.

use crate::{utils::load_image, Error, ImageSource, ImageTensor};
use ndarray::Array4;

/// The per-channel average image the pretrained network was trained with,
/// in the same `0.0..=1.0` range that images are converted to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
}

impl Normalization {
    /// Creates a normalization from a mean in either `0..=255` or `0..=1`
    /// scale. A mean with any component above 1 is assumed to be in 0-255
    /// scale.
    pub fn from_mean(mean: [f32; 3]) -> Self {
        let mean = if mean.iter().any(|m| *m > 1.0) {
            [mean[0] / 255.0, mean[1] / 255.0, mean[2] / 255.0]
        } else {
            mean
        };

        Self { mean }
    }

    /// The RGB mean of the VGG networks trained on ImageNet
    pub fn imagenet() -> Self {
        Self::from_mean([123.68, 116.779, 103.939])
    }
}

/// Loads an image, resizes its larger side to `target_size`, and converts it
/// into a mean-centered tensor with a trailing batch axis.
pub fn preprocess<'a, I: Into<ImageSource<'a>>>(
    raw_image: I,
    target_size: u32,
    normalization: &Normalization,
) -> Result<ImageTensor, Error> {
    let img = load_image(raw_image.into(), target_size)?;
    Ok(image_to_tensor(&img, normalization))
}

pub(crate) fn image_to_tensor(img: &image::RgbImage, normalization: &Normalization) -> ImageTensor {
    let (width, height) = img.dimensions();
    let mut tensor = Array4::zeros((height as usize, width as usize, 3, 1));

    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..3 {
            tensor[[y as usize, x as usize, c, 0]] =
                f32::from(pixel[c]) / 255.0 - normalization.mean[c];
        }
    }

    tensor
}

/// Converts a tensor back into an 8-bit RGB image, adding the mean back and
/// clipping to the displayable range. The input tensor is left untouched.
pub fn postprocess(tensor: &ImageTensor, normalization: &Normalization) -> Result<image::RgbImage, Error> {
    let (height, width, channels, batch) = tensor.dim();
    if channels != 3 || batch != 1 {
        return Err(Error::shape_mismatch(
            "image tensor",
            &[height, width, 3, 1],
            tensor.shape(),
        ));
    }

    let mut img = image::RgbImage::new(width as u32, height as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        for c in 0..3 {
            let value = tensor[[y as usize, x as usize, c, 0]] + normalization.mean[c];
            pixel[c] = (value.max(0.0).min(1.0) * 255.0).round() as u8;
        }
    }

    Ok(img)
}
