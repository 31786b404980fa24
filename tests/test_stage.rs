// tests/test_stage.rs — Integration tests for stage numerics and topology.

use wavefront::error::{ConfigError, Error};
use wavefront::host::HostDevice;
use wavefront::pipeline::validate_topology;
use wavefront::stage::sigmoid;
use wavefront::{Pipeline, PoolMode, Shape, Stage, StageKind};

fn assert_close(got: &[f32], want: &[f32]) {
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!((g - w).abs() < 1e-6, "element {i}: {g} vs {w}");
    }
}

// ===== Numerics =====

#[test]
fn conv_diagonal_kernel() {
    let input: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let weights = vec![1.0, 0.0, 0.0, 1.0];
    let s = Stage::conv("c", Shape::new(3, 3, 1), 2, 1, weights, vec![0.0]).unwrap();
    assert_eq!(s.output_shape(), Shape::new(2, 2, 1));
    let want: Vec<f32> = [6.0, 8.0, 12.0, 14.0].iter().map(|&x| sigmoid(x)).collect();
    assert_close(&s.forward_cpu(&input), &want);
}

#[test]
fn conv_sums_over_input_maps() {
    // Two 2×2 input maps, 2×2 kernel of ones on each, one output map.
    let input = vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
    let s = Stage::conv("c", Shape::new(2, 2, 2), 2, 1, vec![1.0; 8], vec![-100.0]).unwrap();
    assert_close(&s.forward_cpu(&input), &[sigmoid(10.0)]);
}

#[test]
fn sum_pool_scales_then_activates() {
    let s = Stage::pool("p", Shape::new(2, 2, 1), 2, PoolMode::Sum, vec![0.5], vec![-1.0]).unwrap();
    assert_close(&s.forward_cpu(&[1.0, 2.0, 3.0, 4.0]), &[sigmoid(4.0)]);
}

#[test]
fn max_pool_handles_negative_windows() {
    // 4×2 input, 2×2 windows.
    let input = vec![1.0, 5.0, -2.0, -3.0, 0.0, 2.0, -1.0, -7.0];
    let s = Stage::pool("p", Shape::new(4, 2, 1), 2, PoolMode::Max, vec![], vec![]).unwrap();
    assert_eq!(s.kind(), StageKind::Pool(PoolMode::Max));
    assert_eq!(s.forward_cpu(&input), vec![5.0, -1.0]);
}

#[test]
fn full_connect() {
    let weights = vec![1.0, 1.0, 0.5, -1.0];
    let s = Stage::full_connect("f", Shape::flat(2), 2, weights, vec![0.0, 1.0]).unwrap();
    assert_close(&s.forward_cpu(&[1.0, 2.0]), &[sigmoid(3.0), sigmoid(-0.5)]);
}

#[test]
fn distance_is_squared_euclidean() {
    let s = Stage::distance("d", Shape::flat(2), 3, vec![1.0, 2.0, 0.0, 0.0, 3.0, 0.0]).unwrap();
    assert_eq!(s.forward_cpu(&[1.0, 2.0]), vec![0.0, 5.0, 8.0]);
}

#[test]
fn dense_stage_accepts_volume_input() {
    let s = Stage::full_connect("f", Shape::new(1, 1, 3), 1, vec![1.0; 3], vec![0.0]).unwrap();
    assert_close(&s.forward_cpu(&[1.0, -1.0, 0.5]), &[sigmoid(0.5)]);
}

// ===== Construction errors =====

#[test]
fn wrong_parameter_counts() {
    let err = Stage::conv("c", Shape::new(5, 5, 2), 3, 4, vec![0.0; 10], vec![0.0; 4]).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::ParameterCount { what: "weights", expected: 72, actual: 10, .. }
    ));

    let err = Stage::full_connect("f", Shape::flat(3), 2, vec![0.0; 6], vec![0.0]).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::ParameterCount { what: "biases", expected: 2, actual: 1, .. }
    ));
}

#[test]
fn indivisible_pool_window() {
    let err = Stage::pool("p", Shape::new(5, 4, 1), 2, PoolMode::Max, vec![], vec![]).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidStage { .. }));
}

#[test]
fn kernel_larger_than_input() {
    assert!(Stage::conv("c", Shape::new(2, 2, 1), 3, 1, vec![0.0; 9], vec![0.0]).is_err());
}

// ===== Topology =====

#[test]
fn chain_shape_mismatch() {
    let stages = vec![
        Stage::full_connect("a", Shape::flat(2), 3, vec![0.0; 6], vec![0.0; 3]).unwrap(),
        Stage::distance("b", Shape::flat(4), 1, vec![0.0; 4]).unwrap(),
    ];
    assert!(matches!(
        validate_topology(&stages),
        Err(ConfigError::ShapeMismatch { index: 0, .. })
    ));

    let mut dev = HostDevice::in_order();
    let err = Pipeline::new(&mut dev, stages).err().unwrap();
    assert!(matches!(err, Error::Config(ConfigError::ShapeMismatch { .. })));
}

#[test]
fn empty_pipeline() {
    let mut dev = HostDevice::in_order();
    assert!(matches!(
        Pipeline::new(&mut dev, Vec::new()).err().unwrap(),
        Error::Config(ConfigError::EmptyPipeline)
    ));
}

#[test]
fn first_and_last_flags() {
    let stages = vec![
        Stage::full_connect("a", Shape::flat(2), 2, vec![0.0; 4], vec![0.0; 2]).unwrap(),
        Stage::full_connect("b", Shape::flat(2), 2, vec![0.0; 4], vec![0.0; 2]).unwrap(),
        Stage::distance("c", Shape::flat(2), 1, vec![0.0; 2]).unwrap(),
    ];
    let mut dev = HostDevice::in_order();
    let p = Pipeline::new(&mut dev, stages).unwrap();
    let flags: Vec<(bool, bool)> = p.stages().iter().map(|s| (s.is_first(), s.is_last())).collect();
    assert_eq!(flags, vec![(true, false), (false, false), (false, true)]);
    assert_eq!((p.in_size(), p.out_size()), (2, 1));
}
