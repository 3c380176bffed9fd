mod common;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use common::random_inputs;
use lowrank::hessian_factor::HessianFactorProvider;
use lowrank::loss::softmax;
use lowrank::{
    compute_curvature, Batch, BlockPartition, CrossEntropyLoss, CurvatureConfig, FactorConfig,
    FactorRecipe, MseLoss, ParamId, Reduction, SampleSplit, Sequential, Subsample,
};

fn mlp_batch() -> (Sequential<f64>, Vec<Vec<f64>>, Vec<Vec<f64>>) {
    let net = Sequential::mlp(&[3, 4, 2], true, 21);
    (net, random_inputs(6, 3, 22), random_inputs(6, 2, 23))
}

// ══════════════════════════════════════════════
//  Subsampling
// ══════════════════════════════════════════════

#[test]
fn random_subsample_of_whole_batch_is_the_full_batch() {
    let (mut net, inputs, targets) = mlp_batch();
    let batch = Batch::new(&inputs, &targets).unwrap();
    let full = compute_curvature(&mut net, &MseLoss::default(), batch, &CurvatureConfig::default())
        .unwrap();
    let config = CurvatureConfig {
        samples: SampleSplit::uniform(Subsample::Random(6)),
        seed: 99,
        ..CurvatureConfig::default()
    };
    let random = compute_curvature(&mut net, &MseLoss::default(), batch, &config).unwrap();

    assert_eq!(random.split, full.split);
    assert_eq!(
        random.block(0).unwrap().as_ref().unwrap(),
        full.block(0).unwrap().as_ref().unwrap()
    );
}

#[test]
fn subsampled_directions_limit_the_rank() {
    let (mut net, inputs, targets) = mlp_batch();
    let batch = Batch::new(&inputs, &targets).unwrap();
    let config = CurvatureConfig {
        samples: SampleSplit {
            directions: Subsample::First(2),
            ..SampleSplit::default()
        },
        ..CurvatureConfig::default()
    };
    let result = compute_curvature(&mut net, &MseLoss::default(), batch, &config).unwrap();
    let block = result.block(0).unwrap().as_ref().unwrap();
    // two samples, two output columns each
    assert_eq!(block.rank, 4);
    assert!(block.eigenvalues.len() <= 4);
    assert_eq!(result.split.directions, vec![0, 1]);
}

#[test]
fn random_subsample_is_seeded() {
    let (mut net, inputs, targets) = mlp_batch();
    let batch = Batch::new(&inputs, &targets).unwrap();
    let config = |seed| CurvatureConfig {
        samples: SampleSplit::uniform(Subsample::Random(3)),
        seed,
        ..CurvatureConfig::default()
    };
    let a = compute_curvature(&mut net, &MseLoss::default(), batch, &config(4)).unwrap();
    let b = compute_curvature(&mut net, &MseLoss::default(), batch, &config(4)).unwrap();
    assert_eq!(a.split, b.split);
    assert_eq!(a.block(0).unwrap(), b.block(0).unwrap());
    assert!(a.split.directions.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn sum_reduction_rescales_subsets_to_the_batch() {
    // on a subset of n out of N samples, sum reduction weights the subset GGN
    // by N / n and mean reduction by 1 / n
    let (mut net, inputs, targets) = mlp_batch();
    let batch = Batch::new(&inputs, &targets).unwrap();
    let config = CurvatureConfig {
        samples: SampleSplit::uniform(Subsample::First(3)),
        ..CurvatureConfig::default()
    };
    let mean = compute_curvature(&mut net, &MseLoss::default(), batch, &config).unwrap();
    let sum = compute_curvature(&mut net, &MseLoss::new(Reduction::Sum), batch, &config).unwrap();
    let mean = &mean.block(0).unwrap().as_ref().unwrap().eigenvalues;
    let sum = &sum.block(0).unwrap().as_ref().unwrap().eigenvalues;
    assert_eq!(mean.len(), sum.len());
    for (m, s) in mean.iter().zip(sum) {
        assert_relative_eq!(*s, 6.0 * m, max_relative = 1e-10);
    }
}

// ══════════════════════════════════════════════
//  Block partitions
// ══════════════════════════════════════════════

#[test]
fn single_group_equals_global() {
    let (mut net, inputs, targets) = mlp_batch();
    let batch = Batch::new(&inputs, &targets).unwrap();
    let all = vec![
        ParamId::weight(0),
        ParamId::bias(0),
        ParamId::weight(2),
        ParamId::bias(2),
    ];
    let global = compute_curvature(&mut net, &MseLoss::default(), batch, &CurvatureConfig::default())
        .unwrap();
    let config = CurvatureConfig {
        partition: BlockPartition::Groups(vec![all]),
        ..CurvatureConfig::default()
    };
    let grouped = compute_curvature(&mut net, &MseLoss::default(), batch, &config).unwrap();
    assert_eq!(grouped.blocks.len(), 1);
    assert_eq!(grouped.block(0).unwrap(), global.block(0).unwrap());
}

#[test]
fn per_layer_blocks_equal_restricted_requests() {
    let (mut net, inputs, targets) = mlp_batch();
    let batch = Batch::new(&inputs, &targets).unwrap();
    let config = CurvatureConfig {
        partition: BlockPartition::PerLayer,
        ..CurvatureConfig::default()
    };
    let blocks = compute_curvature(&mut net, &MseLoss::default(), batch, &config).unwrap();
    assert_eq!(blocks.blocks.len(), 2);

    for (i, layer) in [0, 2].into_iter().enumerate() {
        let restricted = CurvatureConfig {
            params: Some(vec![ParamId::weight(layer), ParamId::bias(layer)]),
            ..CurvatureConfig::default()
        };
        let alone = compute_curvature(&mut net, &MseLoss::default(), batch, &restricted).unwrap();
        let expected = &alone.block(0).unwrap().as_ref().unwrap().eigenvalues;
        let actual = &blocks.block(i).unwrap().as_ref().unwrap().eigenvalues;
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert_relative_eq!(*a, *e, max_relative = 1e-12);
        }
    }
}

#[test]
fn per_parameter_blocks_follow_group_order() {
    let (mut net, inputs, targets) = mlp_batch();
    let batch = Batch::new(&inputs, &targets).unwrap();
    let config = CurvatureConfig {
        partition: BlockPartition::PerParameter,
        ..CurvatureConfig::default()
    };
    let result = compute_curvature(&mut net, &MseLoss::default(), batch, &config).unwrap();
    let dims: Vec<usize> = result.blocks.iter().map(|r| r.block.dim()).collect();
    assert_eq!(dims, vec![12, 4, 8, 2]);
    assert_eq!(result.successful().count(), 4);
}

// ══════════════════════════════════════════════
//  Monte-Carlo factors
// ══════════════════════════════════════════════

#[test]
fn monte_carlo_factor_converges_to_exact_hessian() {
    const RUNS: u64 = 16;
    const DRAWS: usize = 5_000;
    let loss = CrossEntropyLoss::default();
    let output = vec![0.3, -0.8, 1.1];
    let p = softmax(&output);

    // Gram of the sampled factor, averaged over a fixed run of seeds
    let mut mean = [[0.0; 3]; 3];
    for seed in 0..RUNS {
        let provider = HessianFactorProvider::<f64, _>::resolve(
            &loss,
            &FactorConfig::monte_carlo(DRAWS),
            1_000 + seed,
        )
        .unwrap();
        assert_eq!(provider.recipe(), FactorRecipe::MonteCarlo);
        let columns = provider.factor(&output, &1, 0).unwrap();
        assert_eq!(columns.len(), DRAWS);
        for (i, row) in mean.iter_mut().enumerate() {
            for (j, m) in row.iter_mut().enumerate() {
                *m += columns.iter().map(|s| s[i] * s[j]).sum::<f64>() / RUNS as f64;
            }
        }
    }

    for i in 0..3 {
        for j in 0..3 {
            let exact = if i == j { p[i] - p[i] * p[j] } else { -p[i] * p[j] };
            assert_abs_diff_eq!(mean[i][j], exact, epsilon = 0.01);
        }
    }
}

#[test]
fn monte_carlo_curvature_approaches_exact() {
    let mut net = Sequential::<f64>::mlp(&[2, 3], true, 31);
    let inputs = vec![vec![0.7, -0.4]];
    let targets = vec![2usize];
    let batch = Batch::new(&inputs, &targets).unwrap();
    let loss = CrossEntropyLoss::default();

    let exact = compute_curvature(&mut net, &loss, batch, &CurvatureConfig::default()).unwrap();
    let config = CurvatureConfig {
        factor: FactorConfig::monte_carlo(256),
        seed: 8,
        ..CurvatureConfig::default()
    };
    let sampled = compute_curvature(&mut net, &loss, batch, &config).unwrap();
    assert_eq!(sampled.recipe, FactorRecipe::MonteCarlo);

    let top_exact = exact.block(0).unwrap().as_ref().unwrap().eigenvalues[0];
    let top_sampled = sampled.block(0).unwrap().as_ref().unwrap().eigenvalues[0];
    assert_relative_eq!(top_sampled, top_exact, max_relative = 0.3);

    let again = compute_curvature(&mut net, &loss, batch, &config).unwrap();
    assert_eq!(again.block(0).unwrap(), sampled.block(0).unwrap());
}
