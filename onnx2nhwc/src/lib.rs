//! ONNX graph translator: lowers channel-first (NCHW) inference graphs into
//! a channel-last (NHWC) layer graph, inserting layout conversions only
//! where a consumer needs them.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod format;
pub mod ir;
pub mod lower;
pub mod registry;
pub mod walker;

pub use config::{OutputLayout, TargetCapabilities, TranslateConfig};
pub use error::{Error, Result};
pub use walker::{translate, TargetModel};
