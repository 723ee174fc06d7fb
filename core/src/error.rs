//! Error types for the nanonet-core library.
//!
//! Construction and loading return `NetResult<T>`. A truncated weight file is
//! not an error: it is reported through [`crate::weights::LoadReport`].

use std::io;
use std::path::PathBuf;

use crate::layers::Shape;

/// All fatal conditions the engine can report.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("layer {index}: layer before {kind} layer must output an image (got {shape})")]
    EmptyInput {
        index: usize,
        kind: &'static str,
        shape: Shape,
    },
    #[error("first section must be [net] or [network], found [{found}]")]
    MissingNetSection { found: String },
    #[error("no input parameters supplied")]
    NoInputDimensions,
    #[error("section [{section}]: invalid value {value:?} for option `{key}`")]
    InvalidOption {
        section: String,
        key: String,
        value: String,
    },
    #[error("layer {index}: unknown layer type [{tag}]")]
    UnknownLayerType { index: usize, tag: String },
    #[error("unknown activation `{0}`")]
    UnknownActivation(String),
    #[error("layer {index}: invalid parameter: {reason}")]
    InvalidParameter { index: usize, reason: String },
    #[error("input length mismatch: expected {expected}, got {actual}")]
    InputLengthMismatch { expected: usize, actual: usize },
    #[error("layer {index}: expects input {expected}, previous layer outputs {actual}")]
    ShapeMismatch {
        index: usize,
        expected: Shape,
        actual: Shape,
    },
    #[error("network has no layers")]
    EmptyNetwork,
    #[error("couldn't open weight source {path}")]
    WeightSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("weight header truncated after {read} of {expected} bytes")]
    TruncatedHeader { read: usize, expected: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type NetResult<T> = Result<T, NetError>;
