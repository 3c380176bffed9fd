mod common;

use approx::assert_relative_eq;
use common::random_inputs;
use lowrank::linalg::norm;
use lowrank::{
    compute_curvature, Batch, BlockPartition, CurvatureConfig, CurvatureError, EigenConfig,
    Module, MseLoss, NewtonStepConfig, NumericalError, Outputs, Sequential,
};

/// `y = w · x` on three features: the GGN of squared error is the exact
/// Hessian `(2/N) Σ x xᵀ` and the Newton step is `-H⁻¹ g`.
fn linear_regression() -> (Sequential<f64>, Vec<Vec<f64>>, Vec<Vec<f64>>) {
    let net = Sequential::new(
        3,
        vec![Module::Linear {
            in_features: 3,
            out_features: 1,
            weight: vec![0.2, -0.1, 0.4],
            bias: None,
        }],
    );
    (net, random_inputs(5, 3, 41), random_inputs(5, 1, 42))
}

fn with_damping(damping: f64) -> CurvatureConfig<f64> {
    CurvatureConfig {
        outputs: Outputs {
            newton_step: true,
            ..Outputs::eigenvalues()
        },
        newton: NewtonStepConfig {
            damping,
            ..NewtonStepConfig::default()
        },
        ..CurvatureConfig::default()
    }
}

/// Solve the 3 × 3 system `a x = b` by Cramer's rule.
fn solve3(a: [[f64; 3]; 3], b: [f64; 3]) -> [f64; 3] {
    let det = |m: [[f64; 3]; 3]| {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };
    let d = det(a);
    let mut x = [0.0; 3];
    for (k, xk) in x.iter_mut().enumerate() {
        let mut m = a;
        for i in 0..3 {
            m[i][k] = b[i];
        }
        *xk = det(m) / d;
    }
    x
}

#[test]
fn undamped_step_is_the_newton_step() {
    let (mut net, inputs, targets) = linear_regression();
    let w = [0.2, -0.1, 0.4];
    let n = inputs.len() as f64;
    let mut h = [[0.0; 3]; 3];
    let mut g = [0.0; 3];
    for (x, y) in inputs.iter().zip(&targets) {
        let r = w.iter().zip(x).map(|(a, b)| a * b).sum::<f64>() - y[0];
        for i in 0..3 {
            g[i] += 2.0 * r * x[i] / n;
            for j in 0..3 {
                h[i][j] += 2.0 * x[i] * x[j] / n;
            }
        }
    }
    let expected = solve3(h, g.map(|v| -v));

    let batch = Batch::new(&inputs, &targets).unwrap();
    let result = compute_curvature(&mut net, &MseLoss::default(), batch, &with_damping(0.0)).unwrap();
    let block = result.block(0).unwrap().as_ref().unwrap();
    assert_eq!(block.eigenvalues.len(), 3);
    let step = &block.newton_step.as_ref().unwrap().step;
    for (s, e) in step.iter().zip(expected) {
        assert_relative_eq!(*s, e, epsilon = 1e-10, max_relative = 1e-8);
    }
    // only the requested outputs are returned
    assert!(block.eigenvectors.is_none());
    assert!(block.first_order.is_none());
}

#[test]
fn step_shrinks_as_damping_grows() {
    let (mut net, inputs, targets) = linear_regression();
    let batch = Batch::new(&inputs, &targets).unwrap();
    let mut previous = f64::INFINITY;
    for damping in [0.0, 0.1, 1.0, 10.0, 100.0, 1000.0] {
        let result =
            compute_curvature(&mut net, &MseLoss::default(), batch, &with_damping(damping)).unwrap();
        let step = &result.block(0).unwrap().as_ref().unwrap().newton_step;
        let length = norm(&step.as_ref().unwrap().step);
        assert!(length < previous, "δ = {damping}: {length} >= {previous}");
        previous = length;
    }
}

#[test]
fn negative_damping_skips_or_fails() {
    let (mut net, inputs, targets) = linear_regression();
    let batch = Batch::new(&inputs, &targets).unwrap();
    let eigenvalues = compute_curvature(&mut net, &MseLoss::default(), batch, &with_damping(0.0))
        .unwrap()
        .block(0)
        .unwrap()
        .as_ref()
        .unwrap()
        .eigenvalues
        .clone();
    // between the two smallest eigenvalues: only the smallest direction goes non-positive
    let delta = -(eigenvalues[1] + eigenvalues[2]) / 2.0;

    let result = compute_curvature(&mut net, &MseLoss::default(), batch, &with_damping(delta)).unwrap();
    let step = result.block(0).unwrap().as_ref().unwrap().newton_step.clone().unwrap();
    assert_eq!(step.skipped, vec![2]);
    assert_eq!(step.coefficients[2], 0.0);

    let mut strict = with_damping(delta);
    strict.newton.skip_nonpositive = false;
    let err = compute_curvature(&mut net, &MseLoss::default(), batch, &strict).unwrap_err();
    assert!(matches!(
        err,
        CurvatureError::Numerical(NumericalError::NonPositiveCurvature { direction: 2, .. })
    ));
    assert!(err.is_recoverable());
}

#[test]
fn near_zero_curvature_is_recoverable_by_damping() {
    let (mut net, inputs, targets) = linear_regression();
    let batch = Batch::new(&inputs, &targets).unwrap();
    let smallest = *compute_curvature(&mut net, &MseLoss::default(), batch, &with_damping(0.0))
        .unwrap()
        .block(0)
        .unwrap()
        .as_ref()
        .unwrap()
        .eigenvalues
        .last()
        .unwrap();
    // damp the smallest direction to just above zero
    let mut config = with_damping(-smallest + 1e-13);
    let err = compute_curvature(&mut net, &MseLoss::default(), batch, &config).unwrap_err();
    assert!(matches!(
        err,
        CurvatureError::Numerical(NumericalError::ZeroCurvature { direction: 2, .. })
    ));

    config.newton.damping = 0.5;
    assert!(compute_curvature(&mut net, &MseLoss::default(), batch, &config).is_ok());
}

#[test]
fn failing_block_leaves_other_blocks_intact() {
    let mut net = Sequential::new(
        2,
        vec![
            Module::Linear {
                in_features: 2,
                out_features: 2,
                weight: vec![1.0, 0.2, -0.3, 0.8],
                bias: None,
            },
            Module::Linear {
                in_features: 2,
                out_features: 1,
                weight: vec![3.0, -2.0],
                bias: None,
            },
        ],
    );
    let inputs = random_inputs(4, 2, 51);
    let targets = random_inputs(4, 1, 52);
    let batch = Batch::new(&inputs, &targets).unwrap();
    let per_layer = |damping: f64| CurvatureConfig {
        partition: BlockPartition::PerLayer,
        eigen: EigenConfig {
            top_k: Some(1),
            ..EigenConfig::default()
        },
        newton: NewtonStepConfig {
            damping,
            skip_nonpositive: false,
            ..NewtonStepConfig::default()
        },
        outputs: Outputs::all(),
        ..CurvatureConfig::default()
    };

    let tops: Vec<f64> = compute_curvature(&mut net, &MseLoss::default(), batch, &per_layer(0.0))
        .unwrap()
        .successful()
        .map(|(_, c)| c.eigenvalues[0])
        .collect();
    assert_eq!(tops.len(), 2);
    assert!((tops[0] - tops[1]).abs() > 1e-3 * tops[0].max(tops[1]));
    let weaker = if tops[0] < tops[1] { 0 } else { 1 };

    // damping between the two leading eigenvalues breaks exactly one block
    let result = compute_curvature(
        &mut net,
        &MseLoss::default(),
        batch,
        &per_layer(-(tops[0] + tops[1]) / 2.0),
    )
    .unwrap();
    let failures: Vec<usize> = result.failures().map(|(b, _)| b.index).collect();
    assert_eq!(failures, vec![weaker]);
    assert_eq!(result.successful().count(), 1);

    // the same failure aborts a global request
    let mut global = per_layer(-(tops[0] + tops[1]) / 2.0);
    global.partition = BlockPartition::Global;
    global.eigen.top_k = None;
    global.newton.damping = -2.0 * tops[0].max(tops[1]);
    assert!(compute_curvature(&mut net, &MseLoss::default(), batch, &global).is_err());
}
