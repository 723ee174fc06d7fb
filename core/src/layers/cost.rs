//! Cost layer: squared error against ground truth, for training-style pipelines.
//!
//! Without ground truth in the execution state the layer does nothing, so it
//! can stay at the end of an inference pipeline.

use tracing::{debug, warn};

use super::{ExecutionState, Geometry, Shape};
use crate::math;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CostType {
    /// Sum of squared errors.
    #[default]
    Sse,
}

impl CostType {
    /// Resolve a cost name; unknown names fall back to SSE with a warning.
    pub fn from_name(name: &str) -> Self {
        match name {
            "sse" => Self::Sse,
            other => {
                warn!("couldn't find cost type {other}, going with SSE");
                Self::Sse
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CostLayer {
    pub(crate) geometry: Geometry,
    cost_type: CostType,
    /// Multiplier applied to the stored derivative.
    scale: f32,
    /// `scale * (truth - prediction)`, `batch × inputs` long.
    delta: Vec<f32>,
    /// Sum of squared errors from the last pass that had ground truth.
    cost: f32,
}

impl CostLayer {
    pub fn new(batch: usize, input: Shape, cost_type: CostType, scale: f32) -> Self {
        debug!("cost                                           {:4}", input.total());
        Self {
            geometry: Geometry { batch, input, output: input },
            cost_type,
            scale,
            delta: vec![0.0; batch * input.total()],
            cost: 0.0,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn cost_type(&self) -> CostType {
        self.cost_type
    }

    pub fn delta(&self) -> &[f32] {
        &self.delta
    }

    pub fn cost(&self) -> f32 {
        self.cost
    }

    pub(crate) fn resize_buffers(&mut self) {
        self.delta.resize(self.geometry.batch * self.geometry.inputs(), 0.0);
    }

    pub fn forward(&mut self, state: &mut ExecutionState<'_>, output: &mut [f32]) {
        let Some(truth) = state.truth else {
            return;
        };
        let len = self.geometry.batch * self.geometry.inputs();
        match self.cost_type {
            CostType::Sse => math::l2(&state.input[..len], &truth[..len], &mut self.delta, &mut output[..len]),
        }
        if self.scale != 1.0 {
            self.delta.iter_mut().for_each(|d| *d *= self.scale);
        }
        self.cost = output[..len].iter().sum();
    }
}
