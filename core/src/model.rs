//! Network: an ordered, fixed pipeline of layers over one arena and one workspace.
//!
//! ```text
//! input → Layer[0] → Layer[1] → ... → Layer[N-1] → output
//! ```
//!
//! Shapes are threaded and checked while building, so a topology error fails
//! construction and never a forward pass. Layer `i` writes region `i` of the
//! arena; regions are laid out in execution order, so the forward pass peels
//! the arena front to back and hands each output to the next layer as input.

use tracing::{debug, info, instrument, trace, warn};

use crate::arena::{Arena, Region, Workspace};
use crate::config::NetOptions;
use crate::error::{NetError, NetResult};
use crate::layers::{
    AvgPoolLayer, BlankLayer, ConvolutionalLayer, ConvolutionalParams, CostLayer, CostType,
    ExecutionState, Layer, LayerType, MaxPoolLayer, MaxPoolParams, Shape, SoftmaxLayer,
};

/// Appends layers one at a time, feeding each the previous output shape.
#[derive(Debug)]
pub struct NetworkBuilder {
    options: NetOptions,
    layers: Vec<Layer>,
    shape: Shape,
}

impl NetworkBuilder {
    pub fn new(options: NetOptions) -> Self {
        Self {
            shape: options.input_shape(),
            options,
            layers: Vec::new(),
        }
    }

    /// Output shape of the last layer added (the network input if none yet).
    pub fn current_shape(&self) -> Shape {
        self.shape
    }

    fn next_index(&self) -> usize {
        self.layers.len()
    }

    /// Append an already-constructed layer. Its input shape and batch must match.
    pub fn push(&mut self, layer: Layer) -> NetResult<&mut Self> {
        let index = self.next_index();
        if layer.input_shape() != self.shape {
            return Err(NetError::ShapeMismatch {
                index,
                expected: layer.input_shape(),
                actual: self.shape,
            });
        }
        if layer.batch() != self.options.batch {
            return Err(NetError::InvalidParameter {
                index,
                reason: format!("batch {} differs from network batch {}", layer.batch(), self.options.batch),
            });
        }
        self.shape = layer.output_shape();
        self.layers.push(layer);
        Ok(self)
    }

    pub fn convolutional(&mut self, params: ConvolutionalParams) -> NetResult<&mut Self> {
        let layer = ConvolutionalLayer::new(self.next_index(), self.options.batch, self.shape, params)?;
        self.push(Layer::Convolutional(layer))
    }

    pub fn maxpool(&mut self, params: MaxPoolParams) -> NetResult<&mut Self> {
        let layer = MaxPoolLayer::new(self.next_index(), self.options.batch, self.shape, params)?;
        self.push(Layer::MaxPool(layer))
    }

    pub fn avgpool(&mut self) -> NetResult<&mut Self> {
        let layer = AvgPoolLayer::new(self.next_index(), self.options.batch, self.shape)?;
        self.push(Layer::AvgPool(layer))
    }

    pub fn softmax(&mut self, groups: usize) -> NetResult<&mut Self> {
        let layer = SoftmaxLayer::new(self.next_index(), self.options.batch, self.shape, groups)?;
        self.push(Layer::Softmax(layer))
    }

    pub fn cost(&mut self, cost_type: CostType, scale: f32) -> NetResult<&mut Self> {
        let layer = CostLayer::new(self.options.batch, self.shape, cost_type, scale);
        self.push(Layer::Cost(layer))
    }

    pub fn blank(&mut self, tag: &str) -> NetResult<&mut Self> {
        let layer = BlankLayer::new(self.options.batch, self.shape, tag);
        self.push(Layer::Blank(layer))
    }

    pub fn build(self) -> NetResult<Network> {
        Network::from_layers(self.options, self.layers)
    }
}

/// The inference pipeline. Sole owner of every layer buffer and the workspace.
#[derive(Debug)]
pub struct Network {
    options: NetOptions,
    layers: Vec<Layer>,
    /// Output region of each layer, in layer order.
    buffers: Vec<Region>,
    arena: Arena,
    workspace: Workspace,
    /// Layer whose output is the network output (last non-cost layer).
    output_index: usize,
    seen: u64,
}

impl Network {
    /// Assemble a network from constructed layers, validating the chain.
    pub fn from_layers(options: NetOptions, layers: Vec<Layer>) -> NetResult<Self> {
        if layers.is_empty() {
            return Err(NetError::EmptyNetwork);
        }
        let mut shape = options.input_shape();
        for (index, layer) in layers.iter().enumerate() {
            if layer.input_shape() != shape {
                return Err(NetError::ShapeMismatch {
                    index,
                    expected: layer.input_shape(),
                    actual: shape,
                });
            }
            if layer.batch() != options.batch {
                return Err(NetError::InvalidParameter {
                    index,
                    reason: format!("batch {} differs from network batch {}", layer.batch(), options.batch),
                });
            }
            shape = layer.output_shape();
        }

        let workspace_size = layers.iter().map(Layer::workspace_size).max().unwrap_or(0);
        if workspace_size > options.workspace_size_limit {
            warn!(
                workspace_size,
                limit = options.workspace_size_limit,
                "workspace exceeds configured limit"
            );
        }
        let output_index = layers
            .iter()
            .rposition(|l| l.layer_type() != LayerType::Cost)
            .unwrap_or(0);

        let mut net = Self {
            options,
            layers,
            buffers: Vec::new(),
            arena: Arena::new(),
            workspace: Workspace::with_size(workspace_size),
            output_index,
            seen: 0,
        };
        net.plan_buffers();
        info!(
            layers = net.layers.len(),
            workspace_size,
            "Total BFLOPS {:5.3}",
            net.total_bflops()
        );
        Ok(net)
    }

    fn plan_buffers(&mut self) {
        self.arena.reset();
        self.buffers = self
            .layers
            .iter()
            .map(|layer| self.arena.alloc(layer.batch() * layer.outputs()))
            .collect();
    }

    /// Run every layer in order on `input`; `truth` feeds any cost layer.
    ///
    /// `input` must hold `batch × inputs` values, `truth` (if any)
    /// `batch × output_size` values.
    #[instrument(skip_all, level = "debug", fields(batch = self.options.batch))]
    pub fn forward(&mut self, input: &[f32], truth: Option<&[f32]>) -> NetResult<()> {
        let expected = self.options.batch * self.inputs();
        if input.len() != expected {
            return Err(NetError::InputLengthMismatch { expected, actual: input.len() });
        }
        if let Some(truth) = truth {
            let expected = self.options.batch * self.output_size();
            if truth.len() != expected {
                return Err(NetError::InputLengthMismatch { expected, actual: truth.len() });
            }
        }

        let Self { layers, buffers, arena, workspace, .. } = self;
        let mut state = ExecutionState::new(input, workspace.as_mut_slice());
        state.truth = truth;

        let mut rest: &mut [f32] = arena.as_mut_slice();
        let mut consumed = 0;
        for (index, (layer, region)) in layers.iter_mut().zip(buffers.iter()).enumerate() {
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(region.offset - consumed);
            let (output, tail) = tail.split_at_mut(region.len);
            rest = tail;
            consumed = region.end();

            state.index = index;
            trace!(index, layer = layer.name(), "forward");
            layer.forward(&mut state, output);
            state.input = output;
        }
        Ok(())
    }

    /// Forward `input` and return the network output.
    ///
    /// The returned view borrows the network, so it cannot outlive the next
    /// call or the network itself.
    pub fn predict(&mut self, input: &[f32]) -> NetResult<&[f32]> {
        self.forward(input, None)?;
        Ok(self.output())
    }

    /// Output of the last non-cost layer, `batch × output_size` values.
    pub fn output(&self) -> &[f32] {
        self.arena.region(self.buffers[self.output_index])
    }

    /// Output buffer of layer `index`.
    pub fn layer_output(&self, index: usize) -> Option<&[f32]> {
        self.buffers.get(index).map(|&r| self.arena.region(r))
    }

    /// Elements per batch element in [`Network::output`].
    pub fn output_size(&self) -> usize {
        self.layers[self.output_index].outputs()
    }

    pub fn output_layer(&self) -> &Layer {
        &self.layers[self.output_index]
    }

    /// Total squared error from the last pass with ground truth, if the
    /// network ends in a cost layer.
    pub fn cost(&self) -> Option<f32> {
        match self.layers.last() {
            Some(Layer::Cost(l)) => Some(l.cost()),
            _ => None,
        }
    }

    /// Resize every layer for a new batch size. Buffers are reallocated and
    /// zeroed; parameters are kept.
    pub fn set_batch(&mut self, batch: usize) {
        let batch = batch.max(1);
        self.options.batch = batch;
        for layer in &mut self.layers {
            layer.set_batch(batch);
        }
        self.plan_buffers();
        debug!(batch, "network batch resized");
    }

    /// Fold batch normalization into every convolutional layer's weights.
    pub fn fuse_batchnorm(&mut self) {
        let mut fused = 0;
        for layer in &mut self.layers {
            if let Some(conv) = layer.as_convolutional_mut() {
                if conv.batch_normalize() {
                    conv.fuse_batchnorm();
                    fused += 1;
                }
            }
        }
        debug!(fused, "fused batch normalization");
    }

    pub fn options(&self) -> &NetOptions {
        &self.options
    }

    pub fn batch(&self) -> usize {
        self.options.batch
    }

    pub fn input_shape(&self) -> Shape {
        self.options.input_shape()
    }

    /// Elements per batch element of input.
    pub fn inputs(&self) -> usize {
        self.options.inputs()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    /// Mutable access to a convolutional layer's parameters.
    pub fn convolutional_mut(&mut self, index: usize) -> Option<&mut ConvolutionalLayer> {
        self.layers.get_mut(index).and_then(Layer::as_convolutional_mut)
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Bytes of the shared workspace: the largest single-layer requirement.
    pub fn workspace_size(&self) -> usize {
        self.workspace.size_bytes()
    }

    pub fn total_bflops(&self) -> f64 {
        self.layers.iter().map(Layer::bflops).sum()
    }

    /// Images seen during training, as recorded in the weight file.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub(crate) fn set_seen(&mut self, seen: u64) {
        self.seen = seen;
    }

    /// Training iteration implied by [`Network::seen`].
    pub fn current_iteration(&self) -> u64 {
        let per_iteration = (self.options.batch * self.options.subdivisions).max(1) as u64;
        self.seen / per_iteration
    }
}
