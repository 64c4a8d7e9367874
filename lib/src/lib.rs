// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` is a light API for neural style transfer: it renders the
//! content of one image in the style of another by optimizing the pixels of a
//! new image against features of a pretrained convolutional network.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the builder pattern. Calling
//! `build` on the `SessionBuilder` loads the model and the input images and checks for various
//! configuration errors.
//!
//! `Session` has a `run()` method that optimizes the generated image for a fixed number of
//! iterations, which is returned as a `GeneratedImage`.
//!
//! You can save, stream, or inspect the image and its loss history from `GeneratedImage`.
//!
//! ## Usage
//! Session follows a "builder pattern" for defining parameters, meaning you chain functions together.
//!
//! ```no_run
//! // Create a new session with default parameters
//! let session = neural_style::Session::builder()
//!     // Specify the input images
//!     .content(&"imgs/content.jpg")
//!     .style(&"imgs/style.jpg")
//!     // and the pretrained network to extract features with
//!     .model_path(std::path::Path::new("models/vgg19.json"))
//!     // Set some parameters
//!     .output_size(256)
//!     .iterations(300)
//!     // Build the session
//!     .build().expect("failed to build session");
//!
//! // Generate a new image
//! let generated = session.run(None).expect("style transfer failed");
//!
//! // Save the generated image to disk
//! generated.save("my_stylized_img.png").expect("failed to save generated image");
//! ```
pub mod adam;
mod errors;
pub mod features;
pub mod loss;
pub mod model;
mod ops;
pub mod preprocess;
pub mod session;
mod utils;

pub use image;
pub use ndarray;
use std::path::Path;

pub use errors::{ConfigError, Error, ModelLoadError, NumericInstability};
pub use features::{build_feature_function, FeatureExtractor, LayerIndexMap};
pub use model::{Model, ModelCache};
pub use preprocess::{postprocess, preprocess, Normalization};
pub use session::{
    CancellationToken, GeneratorProgress, LayerRef, ProgressUpdate, Session, SessionBuilder,
};
pub use utils::{load_dynamic_image, ImageSource};

/// An image as fed to the network, `(height, width, channel, batch)` with a
/// batch of 1 and the model's mean subtracted
pub type ImageTensor = ndarray::Array4<f32>;
/// The output of a network layer, `(height, width, channel, batch)`
pub type FeatureMap = ndarray::Array4<f32>;

/// How the generated image is initialized
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Init {
    /// Start from the preprocessed content image
    Content,
    /// Start from seeded gaussian noise
    Noise,
}

struct Parameters {
    output_size: u32,
    style_size: Option<u32>,
    truncate_at: String,
    content_layer: LayerRef,
    content_weight: f32,
    style_layers: Vec<LayerRef>,
    style_weights: Vec<f32>,
    tv_weight: f32,
    init: Init,
    noise_std: f32,
    seed: u64,
    iterations: u32,
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    progress_interval: u32,
    max_thread_count: Option<usize>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            output_size: 512,
            style_size: None,
            truncate_at: "conv5_2".to_owned(),
            // relu4_2 of VGG-19
            content_layer: LayerRef::Index(19),
            content_weight: 1.0,
            // relu1_1, relu2_1, relu3_1, relu4_1, relu5_1 of VGG-19
            style_layers: [1, 5, 9, 17, 25].iter().map(|i| LayerRef::Index(*i)).collect(),
            style_weights: vec![200.0; 5],
            tv_weight: 0.1,
            init: Init::Content,
            noise_std: 1.0,
            seed: 0,
            iterations: 500,
            learning_rate: 0.03,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            progress_interval: 50,
            max_thread_count: None,
        }
    }
}

/// An image generated by a `Session::run()`
pub struct GeneratedImage {
    tensor: ImageTensor,
    normalization: Normalization,
    loss_history: Vec<f32>,
    cancelled: bool,
}

impl GeneratedImage {
    /// Saves the generated image to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        postprocess(&self.tensor, &self.normalization)?.save(&path)?;
        Ok(())
    }

    /// Writes the generated image to the specified stream
    pub fn write<W: std::io::Write>(
        self,
        writer: &mut W,
        fmt: image::ImageOutputFormat,
    ) -> Result<(), Error> {
        let dyn_img = self.into_image()?;
        Ok(dyn_img.write_to(writer, fmt)?)
    }

    /// Writes the loss of every completed iteration, one per line
    pub fn save_loss_history<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        use std::io::Write;

        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        for loss in &self.loss_history {
            writeln!(file, "{}", loss)?;
        }
        file.flush()?;

        Ok(())
    }

    /// The optimized tensor, before postprocessing
    pub fn as_tensor(&self) -> &ImageTensor {
        &self.tensor
    }

    /// The total loss of each completed iteration, in order
    pub fn loss_history(&self) -> &[f32] {
        &self.loss_history
    }

    /// The number of iterations that were completed
    pub fn iterations(&self) -> usize {
        self.loss_history.len()
    }

    /// Whether the run was stopped early through a `CancellationToken`
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Returns the generated output image
    pub fn into_image(self) -> Result<image::DynamicImage, Error> {
        Ok(image::DynamicImage::ImageRgb8(postprocess(
            &self.tensor,
            &self.normalization,
        )?))
    }
}

impl AsRef<ImageTensor> for GeneratedImage {
    fn as_ref(&self) -> &ImageTensor {
        &self.tensor
    }
}
