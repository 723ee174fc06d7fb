//! Layer zoo: the five computational kinds plus a pass-through placeholder.
//!
//! The set of kinds is closed, so a [`Layer`] is an enum and `forward` is a
//! single `match`. Each kind owns its parameters and side buffers; the output
//! buffer lives in the network's arena and is handed in by the caller.

pub mod activations;
pub mod conv;
pub mod cost;
pub mod pooling;

use std::fmt;

pub use activations::{Activation, SoftmaxLayer};
pub use conv::{ConvolutionalLayer, ConvolutionalParams};
pub use cost::{CostLayer, CostType};
pub use pooling::{AvgPoolLayer, MaxPoolLayer, MaxPoolParams};

/// Spatial shape of one batch element: height × width × channels.
///
/// Non-image layers (softmax over a flat vector) use `1 × 1 × n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Shape {
    pub h: usize,
    pub w: usize,
    pub c: usize,
}

impl Shape {
    pub const fn new(h: usize, w: usize, c: usize) -> Self {
        Self { h, w, c }
    }

    pub const fn flat(n: usize) -> Self {
        Self { h: 1, w: 1, c: n }
    }

    pub const fn total(&self) -> usize {
        self.h * self.w * self.c
    }

    /// `total()`, or `None` if the product does not fit in `usize`.
    pub fn checked_total(&self) -> Option<usize> {
        self.h.checked_mul(self.w)?.checked_mul(self.c)
    }

    /// True when all three dimensions are non-zero.
    pub const fn is_image(&self) -> bool {
        self.h > 0 && self.w > 0 && self.c > 0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.w, self.h, self.c)
    }
}

/// Batch size plus input and output shape, shared by every layer kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub batch: usize,
    pub input: Shape,
    pub output: Shape,
}

impl Geometry {
    /// Elements in one batch element of input.
    pub const fn inputs(&self) -> usize {
        self.input.total()
    }

    /// Elements in one batch element of output.
    pub const fn outputs(&self) -> usize {
        self.output.total()
    }
}

/// Layer kind tag, as written in a network description section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerType {
    Convolutional,
    MaxPool,
    AvgPool,
    Softmax,
    Cost,
    Blank,
}

impl LayerType {
    /// Resolve a section tag; accepts the short aliases used by existing configs.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "convolutional" | "conv" => Some(Self::Convolutional),
            "maxpool" | "max" => Some(Self::MaxPool),
            "avgpool" | "avg" => Some(Self::AvgPool),
            "softmax" | "soft" => Some(Self::Softmax),
            "cost" => Some(Self::Cost),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Convolutional => "convolutional",
            Self::MaxPool => "maxpool",
            Self::AvgPool => "avgpool",
            Self::Softmax => "softmax",
            Self::Cost => "cost",
            Self::Blank => "blank",
        }
    }
}

/// Per-call view a layer reads during `forward`.
///
/// Borrows the caller's input (or the previous layer's output) and the
/// network's workspace; owns nothing.
pub struct ExecutionState<'a> {
    pub input: &'a [f32],
    pub truth: Option<&'a [f32]>,
    pub workspace: &'a mut [f32],
    /// Index of the layer currently executing.
    pub index: usize,
}

impl<'a> ExecutionState<'a> {
    pub fn new(input: &'a [f32], workspace: &'a mut [f32]) -> Self {
        Self {
            input,
            truth: None,
            workspace,
            index: 0,
        }
    }

    pub fn with_truth(mut self, truth: &'a [f32]) -> Self {
        self.truth = Some(truth);
        self
    }
}

/// Stand-in for an unrecognized section tag: copies its input through.
#[derive(Debug, Clone)]
pub struct BlankLayer {
    pub(crate) geometry: Geometry,
    tag: String,
}

impl BlankLayer {
    pub fn new(batch: usize, input: Shape, tag: impl Into<String>) -> Self {
        Self {
            geometry: Geometry { batch, input, output: input },
            tag: tag.into(),
        }
    }

    /// The unrecognized tag this layer stands in for.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn forward(&mut self, state: &mut ExecutionState<'_>, output: &mut [f32]) {
        let len = self.geometry.batch * self.geometry.outputs();
        output[..len].copy_from_slice(&state.input[..len]);
    }
}

/// One stage of the pipeline.
#[derive(Debug, Clone)]
pub enum Layer {
    Convolutional(ConvolutionalLayer),
    MaxPool(MaxPoolLayer),
    AvgPool(AvgPoolLayer),
    Softmax(SoftmaxLayer),
    Cost(CostLayer),
    Blank(BlankLayer),
}

impl Layer {
    pub fn layer_type(&self) -> LayerType {
        match self {
            Self::Convolutional(_) => LayerType::Convolutional,
            Self::MaxPool(_) => LayerType::MaxPool,
            Self::AvgPool(_) => LayerType::AvgPool,
            Self::Softmax(_) => LayerType::Softmax,
            Self::Cost(_) => LayerType::Cost,
            Self::Blank(_) => LayerType::Blank,
        }
    }

    pub fn name(&self) -> &'static str {
        self.layer_type().name()
    }

    pub fn geometry(&self) -> &Geometry {
        match self {
            Self::Convolutional(l) => &l.geometry,
            Self::MaxPool(l) => &l.geometry,
            Self::AvgPool(l) => &l.geometry,
            Self::Softmax(l) => &l.geometry,
            Self::Cost(l) => &l.geometry,
            Self::Blank(l) => &l.geometry,
        }
    }

    fn geometry_mut(&mut self) -> &mut Geometry {
        match self {
            Self::Convolutional(l) => &mut l.geometry,
            Self::MaxPool(l) => &mut l.geometry,
            Self::AvgPool(l) => &mut l.geometry,
            Self::Softmax(l) => &mut l.geometry,
            Self::Cost(l) => &mut l.geometry,
            Self::Blank(l) => &mut l.geometry,
        }
    }

    pub fn batch(&self) -> usize {
        self.geometry().batch
    }

    pub fn input_shape(&self) -> Shape {
        self.geometry().input
    }

    pub fn output_shape(&self) -> Shape {
        self.geometry().output
    }

    pub fn inputs(&self) -> usize {
        self.geometry().inputs()
    }

    pub fn outputs(&self) -> usize {
        self.geometry().outputs()
    }

    /// Bytes of shared scratch memory this layer needs during `forward`.
    pub fn workspace_size(&self) -> usize {
        match self {
            Self::Convolutional(l) => l.workspace_size(),
            _ => 0,
        }
    }

    /// Billions of floating-point operations for one batch element.
    pub fn bflops(&self) -> f64 {
        match self {
            Self::Convolutional(l) => l.bflops(),
            Self::MaxPool(l) => l.bflops(),
            _ => 0.0,
        }
    }

    pub fn as_convolutional(&self) -> Option<&ConvolutionalLayer> {
        match self {
            Self::Convolutional(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_convolutional_mut(&mut self) -> Option<&mut ConvolutionalLayer> {
        match self {
            Self::Convolutional(l) => Some(l),
            _ => None,
        }
    }

    /// Change the batch size and resize any batch-dependent side buffers.
    pub fn set_batch(&mut self, batch: usize) {
        self.geometry_mut().batch = batch;
        match self {
            Self::MaxPool(l) => l.resize_buffers(),
            Self::Cost(l) => l.resize_buffers(),
            _ => {}
        }
    }

    /// Run this layer on `state.input`, writing `batch * outputs` values to `output`.
    pub fn forward(&mut self, state: &mut ExecutionState<'_>, output: &mut [f32]) {
        match self {
            Self::Convolutional(l) => l.forward(state, output),
            Self::MaxPool(l) => l.forward(state, output),
            Self::AvgPool(l) => l.forward(state, output),
            Self::Softmax(l) => l.forward(state, output),
            Self::Cost(l) => l.forward(state, output),
            Self::Blank(l) => l.forward(state, output),
        }
    }
}
