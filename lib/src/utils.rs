use crate::Error;
use std::path::Path;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the preprocessor
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a> From<image::RgbImage> for ImageSource<'a> {
    fn from(img: image::RgbImage) -> Self {
        Self::Image(image::DynamicImage::ImageRgb8(img))
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// The dimensions an image of `width`x`height` ends up with once its larger
/// side is scaled to `target`, keeping the aspect ratio
pub(crate) fn fit_larger_side(width: u32, height: u32, target: u32) -> (u32, u32) {
    if width >= height {
        let scaled = (f64::from(height) * f64::from(target) / f64::from(width)).round() as u32;
        (target, scaled.max(1))
    } else {
        let scaled = (f64::from(width) * f64::from(target) / f64::from(height)).round() as u32;
        (scaled.max(1), target)
    }
}

/// Loads an RGB image, resizing it so that its larger side is `target_size`
pub(crate) fn load_image(src: ImageSource<'_>, target_size: u32) -> Result<image::RgbImage, Error> {
    use image::GenericImageView;

    let img = load_dynamic_image(src)?;

    let channels = img.color().channel_count();
    if channels < 3 {
        return Err(Error::shape_mismatch(
            "image channels",
            &[3],
            &[channels as usize],
        ));
    }

    let (width, height) = fit_larger_side(img.width(), img.height(), target_size);

    let img = if img.width() != width || img.height() != height {
        image::imageops::resize(&img.to_rgb8(), width, height, image::imageops::CatmullRom)
    } else {
        img.to_rgb8()
    };

    Ok(img)
}
