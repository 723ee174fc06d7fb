//! General-purpose tests for the kernels and the layer zoo.
//!
//! Covers shape arithmetic, GEMM / im2col, every layer kind in isolation,
//! and the activation functions.

use nanonet_core::math::{self, NO_SOURCE};
use nanonet_core::*;
use proptest::prelude::*;

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol, "index {i}: {a} vs {e}");
    }
}

// =============================================================================
// Shape Tests
// =============================================================================

#[test]
fn test_shape_total_and_display() {
    let s = Shape::new(28, 32, 3);
    assert_eq!(s.total(), 28 * 32 * 3);
    assert!(s.is_image());
    assert_eq!(s.to_string(), "32x28x3");

    let flat = Shape::flat(10);
    assert_eq!(flat.total(), 10);
    assert!(!Shape::new(0, 4, 1).is_image());
}

#[test]
fn test_conv_output_size() {
    assert_eq!(math::conv_output_size(224, 224, 3, 1, 1), Some((224, 224)));
    assert_eq!(math::conv_output_size(224, 224, 7, 2, 3), Some((112, 112)));
    assert_eq!(math::conv_output_size(5, 5, 3, 2, 0), Some((2, 2)));
    assert_eq!(math::conv_output_size(4, 6, 1, 1, 0), Some((4, 6)));
    assert_eq!(math::conv_output_size(2, 2, 5, 1, 0), None);
    assert_eq!(math::conv_output_size(8, 8, 3, 0, 1), None);
    assert_eq!(math::conv_output_size(usize::MAX, 4, 3, 1, 1), None);
    assert_eq!(math::conv_output_size(4, 4, 3, 1, usize::MAX), None);
}

#[test]
fn test_pool_output_size() {
    assert_eq!(math::pool_output_size(224, 224, 2, 2, 1), Some((112, 112)));
    assert_eq!(math::pool_output_size(4, 4, 2, 2, 0), Some((2, 2)));
    assert_eq!(math::pool_output_size(13, 13, 2, 1, 1), Some((13, 13)));
    assert_eq!(math::pool_output_size(1, 1, 3, 1, 0), None);
    assert_eq!(math::pool_output_size(usize::MAX, 1, 1, 1, 1), None);
}

proptest! {
    #[test]
    fn test_conv_output_size_formula(
        h in 1usize..64, w in 1usize..64,
        size in 1usize..8, stride in 1usize..4, pad in 0usize..4,
    ) {
        let got = math::conv_output_size(h, w, size, stride, pad);
        if h + 2 * pad >= size && w + 2 * pad >= size {
            let expected = ((h + 2 * pad - size) / stride + 1, (w + 2 * pad - size) / stride + 1);
            prop_assert_eq!(got, Some(expected));
        } else {
            prop_assert_eq!(got, None);
        }
    }
}

// =============================================================================
// GEMM / im2col Tests
// =============================================================================

#[test]
fn test_gemm_plain() {
    let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
    let mut c = [0.0; 4];
    math::gemm(2, 2, 3, 1.0, &a, 3, &b, 2, 0.0, &mut c, 2);
    assert_eq!(c, [58.0, 64.0, 139.0, 154.0]);
}

#[test]
fn test_gemm_alpha_beta() {
    let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
    let mut c = [1.0; 4];
    math::gemm(2, 2, 3, 0.5, &a, 3, &b, 2, 2.0, &mut c, 2);
    assert_eq!(c, [31.0, 34.0, 71.5, 79.0]);
}

#[test]
fn test_gemm_strided_rows() {
    // C rows are 3 wide, only the first 2 columns are written.
    let a = [2.0, 3.0];
    let b = [1.0, 2.0];
    let mut c = [0.0, 0.0, 99.0, 0.0, 0.0, 99.0];
    math::gemm(2, 2, 1, 1.0, &a, 1, &b, 2, 0.0, &mut c, 3);
    assert_eq!(c, [2.0, 4.0, 99.0, 3.0, 6.0, 99.0]);
}

#[test]
fn test_im2col_padded() {
    let image: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let mut col = vec![-1.0; 9 * 9];
    math::im2col(&image, 1, 3, 3, 3, 1, 1, &mut col);

    // Kernel tap (0, 0) reads the pixel up and to the left.
    assert_eq!(&col[0..9], &[0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 4.0, 5.0]);
    // The centre tap is the image itself.
    assert_eq!(&col[4 * 9..5 * 9], image.as_slice());
    // Tap (2, 2) reads down and to the right.
    assert_eq!(&col[8 * 9..9 * 9], &[5.0, 6.0, 0.0, 8.0, 9.0, 0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn test_add_bias_and_activation() {
    let mut out = vec![0.0; 2 * 2 * 3];
    math::add_bias(&mut out, &[1.0, -2.0], 3, 2, 2);
    assert_eq!(&out[..4], &[1.0, 1.0, -2.0, -2.0]);
    assert_eq!(&out[8..], &[1.0, 1.0, -2.0, -2.0]);

    math::activate_array(&mut out, Activation::Leaky);
    assert_close(&out[..4], &[1.0, 1.0, -0.2, -0.2], 1e-6);
}

// =============================================================================
// Activation Tests
// =============================================================================

#[test]
fn test_activation_values() {
    assert_eq!(Activation::Linear.apply(-3.5), -3.5);
    assert_eq!(Activation::Logistic.apply(0.0), 0.5);
    assert!((Activation::Logistic.apply(4.0) - 0.98201376).abs() < 1e-6);
    assert_eq!(Activation::Leaky.apply(2.0), 2.0);
    assert!((Activation::Leaky.apply(-1.0) + 0.1).abs() < 1e-7);
}

#[test]
fn test_activation_from_str() {
    assert_eq!("leaky".parse::<Activation>().unwrap(), Activation::Leaky);
    assert_eq!("linear".parse::<Activation>().unwrap(), Activation::Linear);
    assert!(matches!(
        "relu6".parse::<Activation>(),
        Err(NetError::UnknownActivation(name)) if name == "relu6"
    ));
}

// =============================================================================
// Convolutional Layer Tests
// =============================================================================

#[test]
fn test_conv_1x1_matches_direct_reference() {
    let input_shape = Shape::new(3, 3, 2);
    let params = ConvolutionalParams {
        filters: 1,
        activation: Activation::Linear,
        ..ConvolutionalParams::default()
    };
    let mut conv = ConvolutionalLayer::new(0, 1, input_shape, params).unwrap();
    assert_eq!(conv.geometry().output, Shape::new(3, 3, 1));
    conv.weights_mut().copy_from_slice(&[0.5, -2.0]);
    conv.biases_mut()[0] = 0.25;

    let input: Vec<f32> = (0..18).map(|v| v as f32 * 0.3 - 1.0).collect();
    let mut workspace = vec![0.0; conv.workspace_size() / 4];
    let mut output = vec![f32::NAN; 9];
    let mut state = ExecutionState::new(&input, &mut workspace);
    conv.forward(&mut state, &mut output);

    let expected: Vec<f32> = (0..9).map(|p| 0.5 * input[p] - 2.0 * input[9 + p] + 0.25).collect();
    assert_close(&output, &expected, 1e-5);
}

#[test]
fn test_conv_3x3_padded_unit_weights() {
    let params = ConvolutionalParams {
        filters: 1,
        size: 3,
        padding: 1,
        activation: Activation::Linear,
        ..ConvolutionalParams::default()
    };
    let mut conv = ConvolutionalLayer::new(0, 1, Shape::new(4, 4, 1), params).unwrap();
    conv.weights_mut().fill(1.0);
    assert_eq!(conv.workspace_size(), 4 * 4 * 9 * 4);

    let input = vec![1.0; 16];
    let mut workspace = vec![0.0; conv.workspace_size() / 4];
    let mut output = vec![0.0; 16];
    conv.forward(&mut ExecutionState::new(&input, &mut workspace), &mut output);

    #[rustfmt::skip]
    let expected = [
        4.0, 6.0, 6.0, 4.0,
        6.0, 9.0, 9.0, 6.0,
        6.0, 9.0, 9.0, 6.0,
        4.0, 6.0, 6.0, 4.0,
    ];
    assert_eq!(output, expected);
}

#[test]
fn test_conv_grouped_keeps_channels_apart() {
    let params = ConvolutionalParams {
        filters: 2,
        groups: 2,
        activation: Activation::Linear,
        ..ConvolutionalParams::default()
    };
    let mut conv = ConvolutionalLayer::new(0, 1, Shape::new(1, 2, 2), params).unwrap();
    assert_eq!(conv.weights().len(), 2);
    conv.weights_mut().copy_from_slice(&[2.0, 3.0]);

    let input = [1.0, 2.0, 10.0, 20.0];
    let mut workspace = vec![0.0; conv.workspace_size() / 4];
    let mut output = [0.0; 4];
    conv.forward(&mut ExecutionState::new(&input, &mut workspace), &mut output);
    assert_eq!(output, [2.0, 4.0, 30.0, 60.0]);
}

#[test]
fn test_conv_rejects_bad_construction() {
    let params = ConvolutionalParams::default();
    assert!(matches!(
        ConvolutionalLayer::new(3, 1, Shape::new(0, 4, 1), params),
        Err(NetError::EmptyInput { index: 3, kind: "convolutional", .. })
    ));

    let grouped = ConvolutionalParams { filters: 4, groups: 3, ..params };
    assert!(matches!(
        ConvolutionalLayer::new(0, 1, Shape::new(4, 4, 6), grouped),
        Err(NetError::InvalidParameter { index: 0, .. })
    ));

    let too_big = ConvolutionalParams { size: 7, ..params };
    assert!(ConvolutionalLayer::new(0, 1, Shape::new(3, 3, 1), too_big).is_err());
}

#[test]
fn test_conv_batchnorm_allocation_and_fuse() {
    let params = ConvolutionalParams {
        filters: 2,
        batch_normalize: true,
        ..ConvolutionalParams::default()
    };
    let mut conv = ConvolutionalLayer::new(0, 1, Shape::new(2, 2, 1), params).unwrap();
    assert_eq!(conv.scales(), &[1.0, 1.0]);
    assert_eq!(conv.rolling_mean(), &[0.0, 0.0]);
    assert_eq!(conv.parameter_count(), 2 + 3 * 2 + 2);

    // biases | scales | mean | variance | weights
    conv.assign_parameters(&[0.5, -1.0, 2.0, 1.0, 1.0, 0.0, 4.0, 1.0, 3.0, 5.0]);
    conv.fuse_batchnorm();

    let k0 = 2.0 / (4.0f32 + 0.00001).sqrt();
    let k1 = 1.0 / (1.0f32 + 0.00001).sqrt();
    assert!(!conv.batch_normalize());
    assert!(conv.scales().is_empty());
    assert_close(conv.biases(), &[0.5 - 1.0 * k0, -1.0], 1e-6);
    assert_close(conv.weights(), &[3.0 * k0, 5.0 * k1], 1e-5);
    assert_eq!(conv.parameter_count(), 4);
}

// =============================================================================
// Pooling Layer Tests
// =============================================================================

#[rustfmt::skip]
const POOL_INPUT: [f32; 16] = [
    1.0, 3.0, 2.0, 1.0,
    4.0, 2.0, 0.0, 5.0,
    6.0, 1.0, 9.0, 8.0,
    0.0, 7.0, 3.0, 2.0,
];

fn run_maxpool(params: MaxPoolParams) -> (Vec<f32>, Vec<usize>) {
    let mut pool = MaxPoolLayer::new(0, 1, Shape::new(4, 4, 1), params).unwrap();
    assert_eq!(pool.geometry().output, Shape::new(2, 2, 1));
    let mut output = vec![0.0; 4];
    pool.forward(&mut ExecutionState::new(&POOL_INPUT, &mut []), &mut output);
    (output, pool.indexes().to_vec())
}

#[test]
fn test_maxpool_2x2_stride2() {
    let params = MaxPoolParams { padding: 0, ..MaxPoolParams::square(2, 2) };
    let (output, indexes) = run_maxpool(params);
    assert_eq!(output, [4.0, 5.0, 7.0, 9.0]);
    assert_eq!(indexes, [4, 7, 13, 10]);
}

#[test]
fn test_maxpool_default_padding_same_windows() {
    // Default padding is size-1 = 1, which offsets the window by 0.
    let (output, indexes) = run_maxpool(MaxPoolParams::square(2, 2));
    assert_eq!(output, [4.0, 5.0, 7.0, 9.0]);
    assert_eq!(indexes, [4, 7, 13, 10]);
}

#[test]
fn test_maxpool_padded_border_ignored() {
    // size 3 stride 1 padding 2: window offset -1, out stays 4x4.
    let mut pool = MaxPoolLayer::new(0, 1, Shape::new(4, 4, 1), MaxPoolParams::square(3, 1)).unwrap();
    assert_eq!(pool.geometry().output, Shape::new(4, 4, 1));
    let negative: Vec<f32> = POOL_INPUT.iter().map(|v| -v - 1.0).collect();
    let mut output = vec![0.0; 16];
    pool.forward(&mut ExecutionState::new(&negative, &mut []), &mut output);
    // Top-left window covers (0..2, 0..2) only: max of -2, -4, -5, -3.
    assert_eq!(output[0], -2.0);
    assert_eq!(pool.indexes()[0], 0);
    assert!(pool.indexes().iter().all(|&i| i != NO_SOURCE));
}

#[test]
fn test_maxpool_padding_only_window_is_float_min() {
    let params = MaxPoolParams { size: 1, stride: 1, padding: 4, depthwise: false, out_channels: 1 };
    let mut pool = MaxPoolLayer::new(0, 1, Shape::new(2, 2, 1), params).unwrap();
    assert_eq!(pool.geometry().output, Shape::new(6, 6, 1));

    let input = [1.0, -2.0, 3.0, 4.0];
    let mut output = vec![0.0; 36];
    pool.forward(&mut ExecutionState::new(&input, &mut []), &mut output);

    assert_eq!(output[0], f32::MIN);
    assert_eq!(pool.indexes()[0], NO_SOURCE);
    assert!(output.iter().all(|v| v.is_finite()));
    // Window offset is padding / 2 = 2, so output (2, 2) reads input (0, 0).
    assert_eq!(output[2 * 6 + 2], 1.0);
    assert_eq!(output[2 * 6 + 3], -2.0);
    assert_eq!(pool.indexes()[3 * 6 + 3], 3);
}

#[test]
fn test_maxpool_depthwise_groups() {
    let input = [1.0, 8.0, 3.0, 2.0, 5.0, 4.0, 7.0, 0.0];
    let mut pool = MaxPoolLayer::new(0, 1, Shape::new(1, 1, 8), MaxPoolParams::depthwise(4)).unwrap();
    assert_eq!(pool.geometry().output, Shape::new(1, 1, 4));
    let mut output = vec![0.0; 4];
    pool.forward(&mut ExecutionState::new(&input, &mut []), &mut output);
    assert_eq!(output, [5.0, 8.0, 7.0, 2.0]);
    assert_eq!(pool.indexes(), &[4, 1, 6, 3]);
}

#[test]
fn test_maxpool_depthwise_rejects_too_many_channels() {
    assert!(matches!(
        MaxPoolLayer::new(2, 1, Shape::new(1, 1, 4), MaxPoolParams::depthwise(5)),
        Err(NetError::InvalidParameter { index: 2, .. })
    ));
}

proptest! {
    #[test]
    fn test_avgpool_constant_plane(value in -1000.0f32..1000.0, h in 1usize..6, w in 1usize..6) {
        let mut pool = AvgPoolLayer::new(0, 2, Shape::new(h, w, 3)).unwrap();
        let input = vec![value; 2 * h * w * 3];
        let mut output = vec![0.0; 6];
        pool.forward(&mut ExecutionState::new(&input, &mut []), &mut output);
        for v in output {
            prop_assert!((v - value).abs() <= value.abs() * 1e-5 + 1e-6);
        }
    }
}

#[test]
fn test_avgpool_means_per_channel() {
    let mut pool = AvgPoolLayer::new(0, 1, Shape::new(2, 2, 2)).unwrap();
    assert_eq!(pool.geometry().output, Shape::new(1, 1, 2));
    let input = [1.0, 2.0, 3.0, 4.0, -1.0, -1.0, 1.0, 5.0];
    let mut output = [0.0; 2];
    pool.forward(&mut ExecutionState::new(&input, &mut []), &mut output);
    assert_eq!(output, [2.5, 1.0]);
}

// =============================================================================
// Softmax Tests
// =============================================================================

#[test]
fn test_softmax_large_values_stay_finite() {
    let input = [1000.0, 1001.0, 999.0, -1000.0];
    let mut output = [0.0; 4];
    math::softmax(&input, 4, 1, &mut output);
    assert!(output.iter().all(|v| v.is_finite()));
    assert!((output.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    assert!(output[1] > output[0] && output[0] > output[2]);
}

#[test]
fn test_softmax_layer_groups() {
    let mut softmax = SoftmaxLayer::new(0, 2, Shape::flat(4), 2).unwrap();
    let input = [0.0, 0.0, 1.0, 3.0, 5.0, 5.0, -2.0, -2.0];
    let mut output = [0.0; 8];
    softmax.forward(&mut ExecutionState::new(&input, &mut []), &mut output);
    for pair in output.chunks(2) {
        assert!((pair[0] + pair[1] - 1.0).abs() < 1e-6);
    }
    assert_eq!(&output[..2], &[0.5, 0.5]);
    assert!((output[3] - 1.0 / (1.0 + (-2.0f32).exp())).abs() < 1e-6);
}

#[test]
fn test_softmax_groups_must_divide() {
    assert!(matches!(
        SoftmaxLayer::new(1, 1, Shape::flat(5), 2),
        Err(NetError::InvalidParameter { index: 1, .. })
    ));
}

proptest! {
    #[test]
    fn test_softmax_sums_to_one(values in prop::collection::vec(-5000.0f32..5000.0, 1..64)) {
        let mut output = vec![0.0; values.len()];
        math::softmax(&values, values.len(), 1, &mut output);
        prop_assert!(output.iter().all(|v| v.is_finite() && *v >= 0.0));
        prop_assert!((output.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_softmax_shift_invariant(
        values in prop::collection::vec(-50.0f32..50.0, 1..32),
        shift in -100.0f32..100.0,
    ) {
        let shifted: Vec<f32> = values.iter().map(|v| v + shift).collect();
        let mut a = vec![0.0; values.len()];
        let mut b = vec![0.0; values.len()];
        math::softmax(&values, values.len(), 1, &mut a);
        math::softmax(&shifted, values.len(), 1, &mut b);
        for (x, y) in a.iter().zip(&b) {
            prop_assert!((x - y).abs() < 1e-4);
        }
    }
}

// =============================================================================
// Cost Layer Tests
// =============================================================================

#[test]
fn test_cost_without_truth_is_inert() {
    let mut cost = CostLayer::new(1, Shape::flat(3), CostType::Sse, 1.0);
    let input = [0.2, 0.3, 0.5];
    let mut output = [7.0; 3];
    cost.forward(&mut ExecutionState::new(&input, &mut []), &mut output);
    assert_eq!(output, [7.0; 3]);
    assert_eq!(cost.cost(), 0.0);
}

#[test]
fn test_cost_sse_with_truth() {
    let mut cost = CostLayer::new(1, Shape::flat(3), CostType::from_name("sse"), 2.0);
    let input = [0.25, 0.25, 0.5];
    let truth = [0.0, 1.0, 0.0];
    let mut output = [0.0; 3];
    let mut workspace: [f32; 0] = [];
    let mut state = ExecutionState::new(&input, &mut workspace).with_truth(&truth);
    cost.forward(&mut state, &mut output);
    assert_close(&output, &[0.0625, 0.5625, 0.25], 1e-6);
    assert!((cost.cost() - 0.875).abs() < 1e-6);
    assert_close(cost.delta(), &[-0.5, 1.5, -1.0], 1e-6);
}

#[test]
fn test_cost_unknown_name_falls_back() {
    assert_eq!(CostType::from_name("smooth"), CostType::Sse);
}

// =============================================================================
// Output Helper Tests
// =============================================================================

#[test]
fn test_argmax_and_top_k() {
    let data = [0.1, 0.5, 0.3, 0.5, 0.05];
    assert_eq!(argmax(&data), Some(1));
    assert_eq!(argmax(&[]), None);
    assert_eq!(top_k(&data, 3), vec![1, 3, 2]);
    assert_eq!(top_k(&data, 10).len(), 5);
    assert!(top_k(&data, 0).is_empty());
}

// =============================================================================
// Arena Tests
// =============================================================================

#[test]
fn test_arena_regions_in_order() {
    let mut arena = Arena::new();
    let a = arena.alloc(4);
    let b = arena.alloc(6);
    assert_eq!(a, Region { offset: 0, len: 4 });
    assert_eq!(b.offset, a.end());
    assert_eq!(arena.used(), 10);

    arena.region_mut(b).fill(2.0);
    assert_eq!(arena.region(a), &[0.0; 4]);
    assert_eq!(arena.region(b), &[2.0; 6]);

    arena.reset();
    assert_eq!(arena.used(), 0);
}

#[test]
fn test_workspace_rounds_up_to_floats() {
    let mut ws = Workspace::with_size(10);
    assert_eq!(ws.size_bytes(), 10);
    assert_eq!(ws.as_mut_slice().len(), 3);
}
