#![allow(dead_code)]

use lowrank::linalg::{dot, jacobi_eigh};
use lowrank::{BackwardHost, Loss, ParamId, Parameters, Reduction, Sequential};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

// ─── Networks and batches ──────────────────────────────────────────────────

/// `3 → 2 → 2`, no bias, no activation.
pub fn deep_linear() -> Sequential<f64> {
    Sequential::new(
        3,
        vec![
            lowrank::Module::Linear {
                in_features: 3,
                out_features: 2,
                weight: vec![0.4, -0.3, 0.8, 0.1, 0.5, -0.6],
                bias: None,
            },
            lowrank::Module::Linear {
                in_features: 2,
                out_features: 2,
                weight: vec![1.2, -0.7, 0.3, 0.9],
                bias: None,
            },
        ],
    )
}

/// `n` inputs of length `len` with entries in `[-1, 1)`.
pub fn random_inputs(n: usize, len: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

// ─── Dense reference ───────────────────────────────────────────────────────

/// Every parameter of `net` with its length, forward order.
pub fn all_params(net: &Sequential<f64>) -> Vec<(ParamId, usize)> {
    net.layers()
        .into_iter()
        .flat_map(|l| l.params.into_iter().map(|p| (p.id, p.len)))
        .collect()
}

/// `C × P` Jacobian of the network output at `x` by central differences.
pub fn dense_jacobian(net: &mut Sequential<f64>, params: &[(ParamId, usize)], x: &[f64]) -> Vec<Vec<f64>> {
    let h = 1e-5;
    let c = net.predict(x).len();
    let mut columns = Vec::new();
    for &(id, len) in params {
        for j in 0..len {
            let orig = net.parameter(id).unwrap()[j];
            net.parameter_mut(id).unwrap()[j] = orig + h;
            let plus = net.predict(x);
            net.parameter_mut(id).unwrap()[j] = orig - h;
            let minus = net.predict(x);
            net.parameter_mut(id).unwrap()[j] = orig;
            columns.push(
                plus.iter()
                    .zip(&minus)
                    .map(|(p, m)| (p - m) / (2.0 * h))
                    .collect::<Vec<f64>>(),
            );
        }
    }
    (0..c)
        .map(|o| columns.iter().map(|col| col[o]).collect())
        .collect()
}

fn batch_weight(reduction: Reduction, n: usize) -> f64 {
    match reduction {
        Reduction::Mean => 1.0 / n as f64,
        Reduction::Sum => 1.0,
    }
}

/// `P × P` GGN `w Σ_n J_nᵀ H_n J_n` from dense Jacobians and exact loss Hessians.
pub fn dense_ggn<L: Loss<f64>>(
    net: &mut Sequential<f64>,
    loss: &L,
    params: &[(ParamId, usize)],
    inputs: &[Vec<f64>],
    targets: &[L::Target],
) -> Vec<Vec<f64>> {
    let p: usize = params.iter().map(|(_, len)| len).sum();
    let w = batch_weight(loss.reduction(), inputs.len());
    let mut g = vec![vec![0.0; p]; p];
    for (x, y) in inputs.iter().zip(targets) {
        let jac = dense_jacobian(net, params, x);
        let f = net.predict(x);
        for s in loss.sqrt_hessian(&f, y).unwrap() {
            // v = J_nᵀ s
            let v: Vec<f64> = (0..p)
                .map(|k| jac.iter().zip(&s).map(|(row, sc)| row[k] * sc).sum())
                .collect();
            for i in 0..p {
                for j in 0..p {
                    g[i][j] += w * v[i] * v[j];
                }
            }
        }
    }
    g
}

/// Gradient of the reduced loss w.r.t. `params`.
pub fn dense_gradient<L: Loss<f64>>(
    net: &mut Sequential<f64>,
    loss: &L,
    params: &[(ParamId, usize)],
    inputs: &[Vec<f64>],
    targets: &[L::Target],
) -> Vec<f64> {
    let p: usize = params.iter().map(|(_, len)| len).sum();
    let w = batch_weight(loss.reduction(), inputs.len());
    let mut grad = vec![0.0; p];
    for (x, y) in inputs.iter().zip(targets) {
        let jac = dense_jacobian(net, params, x);
        let g = loss.gradient(&net.predict(x), y);
        for (k, gk) in grad.iter_mut().enumerate() {
            *gk += w * jac.iter().zip(&g).map(|(row, go)| row[k] * go).sum::<f64>();
        }
    }
    grad
}

/// Eigenpairs of a dense symmetric matrix above `threshold`, largest first.
pub fn dense_eigenpairs(a: &[Vec<f64>], threshold: f64) -> Vec<(f64, Vec<f64>)> {
    let eig = jacobi_eigh(a, 100).unwrap();
    let mut pairs: Vec<(f64, Vec<f64>)> = eig
        .values
        .into_iter()
        .zip(eig.vectors)
        .filter(|(v, _)| *v > threshold)
        .collect();
    pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    pairs
}

pub fn mat_vec(a: &[Vec<f64>], x: &[f64]) -> Vec<f64> {
    a.iter().map(|row| dot(row, x)).collect()
}

/// `‖A u - λ u‖`.
pub fn eigen_residual(a: &[Vec<f64>], value: f64, vector: &[f64]) -> f64 {
    mat_vec(a, vector)
        .iter()
        .zip(vector)
        .map(|(av, u)| (av - value * u).powi(2))
        .sum::<f64>()
        .sqrt()
}
