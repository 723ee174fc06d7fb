//! Convolutional layer: im2col + GEMM per batch element and group.

use tracing::debug;

use super::{Activation, ExecutionState, Geometry, Shape};
use crate::error::{NetError, NetResult};
use crate::math;

/// Epsilon added to the rolling variance when folding batch normalization.
const BATCHNORM_EPSILON: f32 = 0.00001;

/// Hyperparameters of a convolutional layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvolutionalParams {
    pub filters: usize,
    pub groups: usize,
    pub size: usize,
    pub stride: usize,
    pub dilation: usize,
    /// Symmetric zero padding on every edge.
    pub padding: usize,
    pub activation: Activation,
    pub batch_normalize: bool,
}

impl Default for ConvolutionalParams {
    fn default() -> Self {
        Self {
            filters: 1,
            groups: 1,
            size: 1,
            stride: 1,
            dilation: 1,
            padding: 0,
            activation: Activation::Logistic,
            batch_normalize: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvolutionalLayer {
    pub(crate) geometry: Geometry,
    filters: usize,
    groups: usize,
    size: usize,
    stride: usize,
    dilation: usize,
    padding: usize,
    activation: Activation,
    batch_normalize: bool,
    /// `filters × (c / groups) × size × size`.
    weights: Vec<f32>,
    biases: Vec<f32>,
    /// Empty unless batch normalization is enabled.
    scales: Vec<f32>,
    rolling_mean: Vec<f32>,
    rolling_variance: Vec<f32>,
    workspace_size: usize,
}

impl ConvolutionalLayer {
    /// Build a layer for `input` and allocate zeroed parameters.
    ///
    /// `index` is only used to label errors.
    pub fn new(
        index: usize,
        batch: usize,
        input: Shape,
        params: ConvolutionalParams,
    ) -> NetResult<Self> {
        if !input.is_image() {
            return Err(NetError::EmptyInput { index, kind: "convolutional", shape: input });
        }
        let invalid = |reason: String| NetError::InvalidParameter { index, reason };

        let groups = params.groups.max(1);
        if params.filters == 0 || params.size == 0 || params.stride == 0 {
            return Err(invalid(format!(
                "filters, size and stride must be positive (filters={}, size={}, stride={})",
                params.filters, params.size, params.stride
            )));
        }
        if input.c % groups != 0 || params.filters % groups != 0 {
            return Err(invalid(format!(
                "groups={groups} must divide channels={} and filters={}",
                input.c, params.filters
            )));
        }
        let (out_h, out_w) =
            math::conv_output_size(input.h, input.w, params.size, params.stride, params.padding)
                .ok_or_else(|| {
                    invalid(format!(
                        "kernel {}x{} does not fit input {input} with padding {}",
                        params.size, params.size, params.padding
                    ))
                })?;

        let n = params.filters;
        let group_channels = input.c / groups;
        let output = Shape::new(out_h, out_w, n);
        let sizes = output.checked_total().and_then(|_| {
            let kernel = params.size.checked_mul(params.size)?;
            let nweights = group_channels.checked_mul(n)?.checked_mul(kernel)?;
            let workspace = (out_h * out_w)
                .checked_mul(kernel)?
                .checked_mul(group_channels)?
                .checked_mul(std::mem::size_of::<f32>())?;
            Some((nweights, workspace))
        });
        let (nweights, workspace_size) =
            sizes.ok_or_else(|| invalid(format!("output {output} or kernel {0}x{0} too large", params.size)))?;
        let (scales, rolling_mean, rolling_variance) = if params.batch_normalize {
            (vec![1.0; n], vec![0.0; n], vec![0.0; n])
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };

        let layer = Self {
            geometry: Geometry { batch, input, output },
            filters: n,
            groups,
            size: params.size,
            stride: params.stride,
            dilation: params.dilation.max(1),
            padding: params.padding,
            activation: params.activation,
            batch_normalize: params.batch_normalize,
            weights: vec![0.0; nweights],
            biases: vec![0.0; n],
            scales,
            rolling_mean,
            rolling_variance,
            workspace_size,
        };

        debug!(
            "conv  {:5}/{:<4} {:2} x{:2}/{:2}   {} -> {} {:5.3} BF",
            n,
            groups,
            layer.size,
            layer.size,
            layer.stride,
            input,
            layer.geometry.output,
            layer.bflops()
        );
        Ok(layer)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn params(&self) -> ConvolutionalParams {
        ConvolutionalParams {
            filters: self.filters,
            groups: self.groups,
            size: self.size,
            stride: self.stride,
            dilation: self.dilation,
            padding: self.padding,
            activation: self.activation,
            batch_normalize: self.batch_normalize,
        }
    }

    pub fn batch_normalize(&self) -> bool {
        self.batch_normalize
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    pub fn biases_mut(&mut self) -> &mut [f32] {
        &mut self.biases
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    pub fn rolling_mean(&self) -> &[f32] {
        &self.rolling_mean
    }

    pub fn rolling_variance(&self) -> &[f32] {
        &self.rolling_variance
    }

    pub fn workspace_size(&self) -> usize {
        self.workspace_size
    }

    pub fn bflops(&self) -> f64 {
        let out = self.geometry.output;
        2.0 * self.weights.len() as f64 * (out.h * out.w) as f64 / 1_000_000_000.0
    }

    /// Number of floats this layer consumes from a weight file.
    pub fn parameter_count(&self) -> usize {
        let norm = if self.batch_normalize { 3 * self.filters } else { 0 };
        self.biases.len() + norm + self.weights.len()
    }

    /// Fill parameters from one flat run laid out as
    /// `biases, [scales, rolling_mean, rolling_variance], weights`.
    pub fn assign_parameters(&mut self, flat: &[f32]) {
        debug_assert_eq!(flat.len(), self.parameter_count());
        let n = self.filters;
        let (biases, mut rest) = flat.split_at(n);
        self.biases.copy_from_slice(biases);
        if self.batch_normalize {
            let (scales, tail) = rest.split_at(n);
            let (mean, tail) = tail.split_at(n);
            let (variance, tail) = tail.split_at(n);
            self.scales.copy_from_slice(scales);
            self.rolling_mean.copy_from_slice(mean);
            self.rolling_variance.copy_from_slice(variance);
            rest = tail;
        }
        self.weights.copy_from_slice(rest);
    }

    /// Append parameters in weight-file order.
    pub fn extend_parameters(&self, out: &mut Vec<f32>) {
        out.extend_from_slice(&self.biases);
        if self.batch_normalize {
            out.extend_from_slice(&self.scales);
            out.extend_from_slice(&self.rolling_mean);
            out.extend_from_slice(&self.rolling_variance);
        }
        out.extend_from_slice(&self.weights);
    }

    /// Fold the batch-normalization statistics into weights and biases.
    ///
    /// Afterwards the layer no longer carries normalization parameters.
    pub fn fuse_batchnorm(&mut self) {
        if !self.batch_normalize {
            return;
        }
        let filter_size = self.weights.len() / self.filters;
        for f in 0..self.filters {
            let precomputed = self.scales[f] / (self.rolling_variance[f] + BATCHNORM_EPSILON).sqrt();
            self.biases[f] -= self.rolling_mean[f] * precomputed;
            self.weights[f * filter_size..(f + 1) * filter_size]
                .iter_mut()
                .for_each(|w| *w *= precomputed);
        }
        self.batch_normalize = false;
        self.scales.clear();
        self.rolling_mean.clear();
        self.rolling_variance.clear();
    }

    pub fn forward(&mut self, state: &mut ExecutionState<'_>, output: &mut [f32]) {
        let Geometry { batch, input, output: out_shape } = self.geometry;
        let outputs = out_shape.total();
        let output = &mut output[..batch * outputs];
        math::fill(output, 0.0);

        let group_channels = input.c / self.groups;
        let group_inputs = group_channels * input.h * input.w;
        let m = self.filters / self.groups;
        let k = self.size * self.size * group_channels;
        let n = out_shape.h * out_shape.w;
        let group_weights = self.weights.len() / self.groups;
        // A 1x1 stride-1 unpadded kernel reads the image itself as the column matrix.
        let direct = self.size == 1 && self.stride == 1 && self.padding == 0;

        for b in 0..batch {
            for j in 0..self.groups {
                let a = &self.weights[j * group_weights..(j + 1) * group_weights];
                let im_start = (b * self.groups + j) * group_inputs;
                let im = &state.input[im_start..im_start + group_inputs];
                let c_start = (b * self.groups + j) * n * m;
                let c = &mut output[c_start..c_start + n * m];
                if direct {
                    math::gemm(m, n, k, 1.0, a, k, im, n, 1.0, c, n);
                } else {
                    let col = &mut state.workspace[..k * n];
                    math::im2col(im, group_channels, input.h, input.w, self.size, self.stride, self.padding, col);
                    math::gemm(m, n, k, 1.0, a, k, col, n, 1.0, c, n);
                }
            }
        }

        math::add_bias(output, &self.biases, batch, self.filters, n);
        math::activate_array(output, self.activation);
    }
}
