//! Activation functions and the Softmax layer.

use std::str::FromStr;

use tracing::debug;

use super::{ExecutionState, Geometry, Shape};
use crate::error::{NetError, NetResult};
use crate::math;

/// Pointwise activation applied after the bias add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Linear,
    Logistic,
    Leaky,
}

impl Activation {
    #[inline(always)]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Linear => x,
            Self::Logistic => 1.0 / (1.0 + (-x).exp()),
            Self::Leaky => {
                if x > 0.0 {
                    x
                } else {
                    0.1 * x
                }
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Logistic => "logistic",
            Self::Leaky => "leaky",
        }
    }
}

impl FromStr for Activation {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "logistic" => Ok(Self::Logistic),
            "leaky" => Ok(Self::Leaky),
            other => Err(NetError::UnknownActivation(other.to_string())),
        }
    }
}

/// Softmax over each group of every batch element. Typically the classifier head.
#[derive(Debug, Clone)]
pub struct SoftmaxLayer {
    pub(crate) geometry: Geometry,
    groups: usize,
}

impl SoftmaxLayer {
    pub fn new(index: usize, batch: usize, input: Shape, groups: usize) -> NetResult<Self> {
        let inputs = input.total();
        if inputs == 0 {
            return Err(NetError::EmptyInput { index, kind: "softmax", shape: input });
        }
        if groups == 0 || inputs % groups != 0 {
            return Err(NetError::InvalidParameter {
                index,
                reason: format!("groups={groups} must divide inputs={inputs}"),
            });
        }
        debug!("softmax                                        {:4}", inputs);
        Ok(Self {
            geometry: Geometry { batch, input, output: input },
            groups,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn forward(&mut self, state: &mut ExecutionState<'_>, output: &mut [f32]) {
        let Geometry { batch, .. } = self.geometry;
        let inputs = self.geometry.inputs();
        let group_size = inputs / self.groups;
        math::softmax_batched(
            state.input,
            group_size,
            batch, inputs,
            self.groups, group_size,
            1,
            output,
        );
    }
}
