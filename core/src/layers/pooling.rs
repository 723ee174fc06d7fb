//! Pooling layers: windowed / depthwise MaxPool and global AvgPool.
//!
//! No learnable parameters and no activation.

use tracing::debug;

use super::{ExecutionState, Geometry, Shape};
use crate::error::{NetError, NetResult};
use crate::math;

/// Hyperparameters of a max-pool layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPoolParams {
    pub size: usize,
    pub stride: usize,
    /// Total padding; the window is offset by `padding / 2`.
    pub padding: usize,
    /// Reduce across channel groups instead of a spatial window.
    pub depthwise: bool,
    /// Output channels in depthwise mode; ignored otherwise.
    pub out_channels: usize,
}

impl MaxPoolParams {
    /// Square window with the default padding of `size - 1`.
    pub fn square(size: usize, stride: usize) -> Self {
        Self {
            size,
            stride,
            padding: size.saturating_sub(1),
            depthwise: false,
            out_channels: 1,
        }
    }

    pub fn depthwise(out_channels: usize) -> Self {
        Self {
            size: 1,
            stride: 1,
            padding: 0,
            depthwise: true,
            out_channels,
        }
    }
}

/// Max pooling with an argmax index buffer.
#[derive(Debug, Clone)]
pub struct MaxPoolLayer {
    pub(crate) geometry: Geometry,
    size: usize,
    stride: usize,
    padding: usize,
    depthwise: bool,
    /// Flat source index of every output's maximum, `batch × outputs` long.
    indexes: Vec<usize>,
}

impl MaxPoolLayer {
    pub fn new(index: usize, batch: usize, input: Shape, params: MaxPoolParams) -> NetResult<Self> {
        if !input.is_image() {
            return Err(NetError::EmptyInput { index, kind: "maxpool", shape: input });
        }
        let invalid = |reason: String| NetError::InvalidParameter { index, reason };

        let output = if params.depthwise {
            if params.out_channels == 0 || params.out_channels > input.c {
                return Err(invalid(format!(
                    "depthwise out_channels={} must be within 1..={}",
                    params.out_channels, input.c
                )));
            }
            Shape::new(input.h, input.w, params.out_channels)
        } else {
            if params.size == 0 || params.stride == 0 {
                return Err(invalid(format!(
                    "size and stride must be positive (size={}, stride={})",
                    params.size, params.stride
                )));
            }
            let (out_h, out_w) =
                math::pool_output_size(input.h, input.w, params.size, params.stride, params.padding)
                    .ok_or_else(|| {
                        invalid(format!(
                            "window {0}x{0} does not fit input {input} with padding {1}",
                            params.size, params.padding
                        ))
                    })?;
            Shape::new(out_h, out_w, input.c)
        };
        let buffer_len = output
            .checked_total()
            .and_then(|total| total.checked_mul(batch))
            .ok_or_else(|| invalid(format!("output {output} too large")))?;

        let layer = Self {
            geometry: Geometry { batch, input, output },
            size: params.size,
            stride: params.stride,
            padding: params.padding,
            depthwise: params.depthwise,
            indexes: vec![0; buffer_len],
        };
        debug!(
            "max               {:2}x{:2}/{:2}   {} -> {} {:5.3} BF",
            layer.size,
            layer.size,
            layer.stride,
            input,
            output,
            layer.bflops()
        );
        Ok(layer)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn params(&self) -> MaxPoolParams {
        MaxPoolParams {
            size: self.size,
            stride: self.stride,
            padding: self.padding,
            depthwise: self.depthwise,
            out_channels: self.geometry.output.c,
        }
    }

    /// Source index of each output's maximum from the last forward pass.
    ///
    /// Windows that covered only padding hold [`math::NO_SOURCE`].
    pub fn indexes(&self) -> &[usize] {
        &self.indexes
    }

    pub fn bflops(&self) -> f64 {
        let Geometry { input, output, .. } = self.geometry;
        (self.size * self.size * input.c * output.h * output.w) as f64 / 1_000_000_000.0
    }

    pub(crate) fn resize_buffers(&mut self) {
        self.indexes.resize(self.geometry.batch * self.geometry.outputs(), 0);
    }

    pub fn forward(&mut self, state: &mut ExecutionState<'_>, output: &mut [f32]) {
        let Geometry { batch, input, output: out } = self.geometry;
        if self.depthwise {
            math::max_pool_depth(
                state.input, output, &mut self.indexes,
                batch, input.c, input.h, input.w,
                out.c,
            );
        } else {
            math::max_pool(
                state.input, output, &mut self.indexes,
                batch, input.c, input.h, input.w,
                out.h, out.w,
                self.size, self.stride, self.padding,
            );
        }
    }
}

/// Global average pooling: every channel plane collapses to its mean.
#[derive(Debug, Clone)]
pub struct AvgPoolLayer {
    pub(crate) geometry: Geometry,
}

impl AvgPoolLayer {
    pub fn new(index: usize, batch: usize, input: Shape) -> NetResult<Self> {
        if !input.is_image() {
            return Err(NetError::EmptyInput { index, kind: "avgpool", shape: input });
        }
        let output = Shape::new(1, 1, input.c);
        debug!("avg                          {} -> {}", input, output);
        Ok(Self { geometry: Geometry { batch, input, output } })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn forward(&mut self, state: &mut ExecutionState<'_>, output: &mut [f32]) {
        let Geometry { batch, input, .. } = self.geometry;
        math::avg_pool_global(state.input, output, batch, input.c, input.h * input.w);
    }
}
