//! Stateless f32 kernels for CPU inference.
//!
//! Layout convention: every image tensor is CHW, batch-major
//! (`index = x + w * (y + h * (channel + c * batch))`), matching the weight
//! files this engine consumes.
//!
//! Slice-length contracts are the caller's responsibility: layers derive every
//! size from shapes fixed at construction, so the kernels only `debug_assert!`.
//! Independent outputs are fanned out with rayon; nothing here blocks.

use rayon::prelude::*;

use crate::layers::activations::Activation;

/// Marker stored in a pooling index buffer when a window saw no valid input.
pub const NO_SOURCE: usize = usize::MAX;

// =============================================================================
// Shape helpers
// =============================================================================

/// Output spatial size of a convolution: `(len + 2*pad - size) / stride + 1`.
///
/// Returns `None` when the padded input is smaller than the kernel, stride is 0,
/// or the padded length overflows.
pub fn conv_output_size(
    h: usize, w: usize,
    size: usize, stride: usize, pad: usize,
) -> Option<(usize, usize)> {
    let dim = |len: usize| {
        if stride == 0 {
            return None;
        }
        let padded = pad.checked_mul(2).and_then(|p| len.checked_add(p))?;
        padded.checked_sub(size).map(|span| span / stride + 1)
    };
    Some((dim(h)?, dim(w)?))
}

/// Output spatial size of a windowed pool: `(len + padding - size) / stride + 1`.
///
/// `padding` is the total padding; the window starts `padding / 2` before the edge.
pub fn pool_output_size(
    h: usize, w: usize,
    size: usize, stride: usize, padding: usize,
) -> Option<(usize, usize)> {
    let dim = |len: usize| {
        if stride == 0 {
            return None;
        }
        len.checked_add(padding)?.checked_sub(size).map(|span| span / stride + 1)
    };
    Some((dim(h)?, dim(w)?))
}

// =============================================================================
// BLAS-style primitives
// =============================================================================

/// Set every element of `x` to `value`.
pub fn fill(x: &mut [f32], value: f32) {
    x.iter_mut().for_each(|v| *v = value);
}

/// General matrix multiply, no transposes: `C = alpha * A * B + beta * C`.
///
/// `A` is `m×k` with row stride `lda`, `B` is `k×n` with row stride `ldb`,
/// `C` is `m×n` with row stride `ldc`. Rows of `C` are computed in parallel;
/// within a row the accumulation order is `p` then `j`, which keeps results
/// identical to a serial i-k-j loop nest.
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    m: usize, n: usize, k: usize,
    alpha: f32,
    a: &[f32], lda: usize,
    b: &[f32], ldb: usize,
    beta: f32,
    c: &mut [f32], ldc: usize,
) {
    if m == 0 || n == 0 {
        return;
    }
    debug_assert!(a.len() >= (m - 1) * lda + k);
    debug_assert!(k == 0 || b.len() >= (k - 1) * ldb + n);
    debug_assert!(c.len() >= (m - 1) * ldc + n);

    let c_used = (m - 1) * ldc + n;
    c[..c_used]
        .par_chunks_mut(ldc)
        .enumerate()
        .for_each(|(i, c_row)| {
            let c_row = &mut c_row[..n];
            if beta != 1.0 {
                c_row.iter_mut().for_each(|v| *v *= beta);
            }
            let a_row = &a[i * lda..i * lda + k];
            for (p, &a_ip) in a_row.iter().enumerate() {
                let a_part = alpha * a_ip;
                let b_row = &b[p * ldb..p * ldb + n];
                for (cv, &bv) in c_row.iter_mut().zip(b_row) {
                    *cv += a_part * bv;
                }
            }
        });
}

// =============================================================================
// Convolution lowering
// =============================================================================

/// Unfold a `channels × height × width` image into a
/// `(channels·ksize·ksize) × (out_h·out_w)` matrix.
///
/// Row `r` encodes `(channel, ky, kx)` as `r = (channel * ksize + ky) * ksize + kx`;
/// column `c` is the output position `y * out_w + x`. Samples that fall into the
/// padding read as zero.
#[allow(clippy::too_many_arguments)]
pub fn im2col(
    data_im: &[f32],
    channels: usize, height: usize, width: usize,
    ksize: usize, stride: usize, pad: usize,
    data_col: &mut [f32],
) {
    let Some((height_col, width_col)) = conv_output_size(height, width, ksize, stride, pad) else {
        return;
    };
    let plane = height_col * width_col;
    let channels_col = channels * ksize * ksize;
    debug_assert!(data_im.len() >= channels * height * width);
    debug_assert!(data_col.len() >= channels_col * plane);

    data_col[..channels_col * plane]
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(row, col)| {
            let w_offset = row % ksize;
            let h_offset = (row / ksize) % ksize;
            let c_im = row / ksize / ksize;
            let channel = &data_im[c_im * height * width..(c_im + 1) * height * width];
            for y in 0..height_col {
                // Padded coordinates; subtract `pad` to land in the image.
                let im_row = (h_offset + y * stride) as isize - pad as isize;
                for x in 0..width_col {
                    let im_col = (w_offset + x * stride) as isize - pad as isize;
                    col[y * width_col + x] = if im_row >= 0
                        && im_row < height as isize
                        && im_col >= 0
                        && im_col < width as isize
                    {
                        channel[im_row as usize * width + im_col as usize]
                    } else {
                        0.0
                    };
                }
            }
        });
}

/// Add `biases[i]` to every element of channel `i`, for every batch element.
///
/// `output` is `batch × n × size`.
pub fn add_bias(output: &mut [f32], biases: &[f32], batch: usize, n: usize, size: usize) {
    debug_assert!(output.len() >= batch * n * size);
    debug_assert!(biases.len() >= n);
    if size == 0 {
        return;
    }
    output[..batch * n * size]
        .par_chunks_mut(size)
        .enumerate()
        .for_each(|(plane, values)| {
            let bias = biases[plane % n];
            values.iter_mut().for_each(|v| *v += bias);
        });
}

// =============================================================================
// Activations
// =============================================================================

/// Apply `activation` to every element in place.
pub fn activate_array(x: &mut [f32], activation: Activation) {
    if activation == Activation::Linear {
        return;
    }
    x.par_iter_mut().for_each(|v| *v = activation.apply(*v));
}

/// Softmax over `n` values addressed as `input[i * stride]`.
///
/// The group maximum is subtracted before exponentiating so large logits
/// cannot overflow; the result is mathematically unchanged.
pub fn softmax(input: &[f32], n: usize, stride: usize, output: &mut [f32]) {
    if n == 0 {
        return;
    }
    let largest = (0..n)
        .map(|i| input[i * stride])
        .fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0f32;
    for i in 0..n {
        let e = (input[i * stride] - largest).exp();
        sum += e;
        output[i * stride] = e;
    }
    for i in 0..n {
        output[i * stride] /= sum;
    }
}

/// Batched, grouped softmax.
///
/// For each batch element `b` and group `g`, runs [`softmax`] on the `n` values
/// starting at `b * batch_offset + g * group_offset`.
#[allow(clippy::too_many_arguments)]
pub fn softmax_batched(
    input: &[f32],
    n: usize,
    batch: usize, batch_offset: usize,
    groups: usize, group_offset: usize,
    stride: usize,
    output: &mut [f32],
) {
    for b in 0..batch {
        for g in 0..groups {
            let start = b * batch_offset + g * group_offset;
            softmax(&input[start..], n, stride, &mut output[start..]);
        }
    }
}

// =============================================================================
// Pooling
// =============================================================================

/// Windowed max pool over a batch of CHW images.
///
/// Each output records its maximum and the flat batch-wide index of the source
/// element. The window is offset by `-padding / 2`; positions outside the image
/// do not take part in the reduction. A window holding only padding yields
/// `f32::MIN` with index [`NO_SOURCE`].
#[allow(clippy::too_many_arguments)]
pub fn max_pool(
    input: &[f32],
    output: &mut [f32],
    indexes: &mut [usize],
    batch: usize, c: usize, h: usize, w: usize,
    out_h: usize, out_w: usize,
    size: usize, stride: usize, padding: usize,
) {
    let out_plane = out_h * out_w;
    let in_plane = h * w;
    if out_plane == 0 {
        return;
    }
    debug_assert!(input.len() >= batch * c * in_plane);
    debug_assert!(output.len() >= batch * c * out_plane);
    debug_assert!(indexes.len() >= batch * c * out_plane);

    let offset = (padding / 2) as isize;
    output[..batch * c * out_plane]
        .par_chunks_mut(out_plane)
        .zip(indexes[..batch * c * out_plane].par_chunks_mut(out_plane))
        .enumerate()
        .for_each(|(plane, (out, idx))| {
            let base = plane * in_plane;
            for i in 0..out_h {
                for j in 0..out_w {
                    let mut max = f32::MIN;
                    let mut max_i = NO_SOURCE;
                    for n in 0..size {
                        let cur_h = (i * stride + n) as isize - offset;
                        if cur_h < 0 || cur_h >= h as isize {
                            continue;
                        }
                        for m in 0..size {
                            let cur_w = (j * stride + m) as isize - offset;
                            if cur_w < 0 || cur_w >= w as isize {
                                continue;
                            }
                            let index = base + cur_h as usize * w + cur_w as usize;
                            let val = input[index];
                            if max_i == NO_SOURCE || val > max {
                                max = val;
                                max_i = index;
                            }
                        }
                    }
                    out[i * out_w + j] = max;
                    idx[i * out_w + j] = max_i;
                }
            }
        });
}

/// Depthwise max pool: at each spatial position, output channel `g` is the max of
/// input channels `g, g + out_c, g + 2*out_c, ...`.
#[allow(clippy::too_many_arguments)]
pub fn max_pool_depth(
    input: &[f32],
    output: &mut [f32],
    indexes: &mut [usize],
    batch: usize, c: usize, h: usize, w: usize,
    out_c: usize,
) {
    let plane = h * w;
    if plane == 0 || out_c == 0 {
        return;
    }
    debug_assert!(input.len() >= batch * c * plane);
    debug_assert!(output.len() >= batch * out_c * plane);

    output[..batch * out_c * plane]
        .par_chunks_mut(plane)
        .zip(indexes[..batch * out_c * plane].par_chunks_mut(plane))
        .enumerate()
        .for_each(|(out_plane, (out, idx))| {
            let b = out_plane / out_c;
            let g = out_plane % out_c;
            for s in 0..plane {
                let mut max = f32::MIN;
                let mut max_i = NO_SOURCE;
                for k in (g..c).step_by(out_c) {
                    let in_index = s + plane * (k + c * b);
                    let val = input[in_index];
                    if max_i == NO_SOURCE || val > max {
                        max = val;
                        max_i = in_index;
                    }
                }
                out[s] = max;
                idx[s] = max_i;
            }
        });
}

/// Global average pool: one mean per (batch, channel) plane of `spatial` values.
pub fn avg_pool_global(input: &[f32], output: &mut [f32], batch: usize, c: usize, spatial: usize) {
    debug_assert!(input.len() >= batch * c * spatial);
    debug_assert!(output.len() >= batch * c);
    for (plane, out) in output[..batch * c].iter_mut().enumerate() {
        let values = &input[plane * spatial..(plane + 1) * spatial];
        let mut sum = 0.0f32;
        for &v in values {
            sum += v;
        }
        *out = sum / spatial as f32;
    }
}

// =============================================================================
// Cost
// =============================================================================

/// Squared error: `delta = truth - pred`, `error = delta²`.
pub fn l2(pred: &[f32], truth: &[f32], delta: &mut [f32], error: &mut [f32]) {
    debug_assert_eq!(pred.len(), truth.len());
    for (((&p, &t), d), e) in pred.iter().zip(truth).zip(delta.iter_mut()).zip(error.iter_mut()) {
        let diff = t - p;
        *e = diff * diff;
        *d = diff;
    }
}

// =============================================================================
// Output helpers
// =============================================================================

/// Index of the largest value, first one wins on ties. `None` for an empty slice.
pub fn argmax(data: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in data.iter().enumerate() {
        match best {
            Some((_, max)) if v <= max => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Indexes of the `k` largest values, largest first.
///
/// Ties keep the lower index first. `k` is clamped to `data.len()`.
pub fn top_k(data: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..data.len()).collect();
    order.sort_by(|&a, &b| data[b].total_cmp(&data[a]).then(a.cmp(&b)));
    order.truncate(k.min(data.len()));
    order
}
