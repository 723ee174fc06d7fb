//! # nanonet-core: CPU inference for darknet-style networks
//!
//! Runs a fixed, linear chain of layers over `f32` tensors and loads trained
//! parameters from the darknet binary weight format.
//!
//! ## Architecture
//!
//! - **Layer Zoo**: Convolutional, MaxPool, AvgPool, Softmax, Cost
//! - **Arena**: one buffer holds every layer output; one shared workspace holds im2col columns
//! - **Network**: shapes checked at build time, strict sequential forward pass
//! - **Weights**: versioned header, per-layer parameter runs, partial loads reported
//!
//! ## Usage
//!
//! ```ignore
//! use nanonet_core::*;
//!
//! let mut net = parse_network(&tiny_darknet(), BuildOptions::default())?;
//! net.load_weights_file("tiny.weights", usize::MAX)?;
//! net.fuse_batchnorm();
//!
//! let probabilities = net.predict(&image)?;
//! let best = top_k(probabilities, 5);
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod layers;
pub mod math;
pub mod model;
pub mod weights;

// Re-export primary types
pub use arena::{Arena, Region, Workspace};
pub use config::{parse_network, tiny_darknet, BuildOptions, LearningRatePolicy, NetOptions, Section};
pub use error::{NetError, NetResult};
pub use layers::{
    Activation, AvgPoolLayer, BlankLayer, ConvolutionalLayer, ConvolutionalParams, CostLayer, CostType,
    ExecutionState, Geometry, Layer, LayerType, MaxPoolLayer, MaxPoolParams, Shape, SoftmaxLayer,
};
pub use math::{argmax, top_k};
pub use model::{Network, NetworkBuilder};
pub use weights::{FormatVersion, LoadReport, WeightHeader, WeightStore};
