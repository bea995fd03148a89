//! A multi-resolution U-Net for biomedical image segmentation.
//!
//! The network is a plain valid-convolution U-Net whose encoder receives, at a
//! configurable depth, an extra set of feature maps computed from a list of low
//! resolution inputs. Tensor operations are delegated to candle, this crate
//! assembles the layers and keeps the shapes consistent through the recursion.
//!
//! ```no_run
//! use candle::{DType, Device, Tensor};
//! use fmap_unet::{Config, UNetWithFmap};
//!
//! # fn main() -> candle::Result<()> {
//! let device = Device::Cpu;
//! let cfg = Config::default();
//! let varmap = candle_nn::VarMap::new();
//! let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let model = UNetWithFmap::new(&cfg, vb)?;
//! let xs = Tensor::randn(0f32, 1f32, (1, 1, 268, 268), &device)?;
//! let ys = model.forward(&xs, &[])?;
//! assert_eq!(ys.dims(), [1, model.out_channels(), 56, 56]);
//! # Ok(())
//! # }
//! ```
pub mod activation;
pub mod config;
pub mod error;
pub mod ops;
pub mod shape;
pub mod unet;

pub use activation::Activation;
pub use config::{Config, Padding, Upsampling};
pub use error::ConfigError;
pub use shape::{infer_output_shape, FeatureShape, ShapeTrace};
pub use unet::UNetWithFmap;
