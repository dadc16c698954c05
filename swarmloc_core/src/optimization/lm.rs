// swarmloc_core/src/optimization/lm.rs

//! A dense Levenberg-Marquardt solver for `Problem`.
//!
//! Each iteration linearizes every residual block (central finite
//! differences), applies the block's Huber loss as an IRLS weight, builds the
//! normal equations `JᵀJ δ = -Jᵀr`, damps their diagonal and accepts the step
//! only if the cost decreases. Residual blocks are evaluated in parallel on a
//! private rayon pool.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use std::time::{Duration, Instant};

use crate::error::SolverError;
use crate::optimization::params::PoseParams;
use crate::optimization::problem::{Problem, ResidualEntry};
use crate::pose::wrap_angle;

const NUMERIC_DIFF_STEP: f64 = 1e-6;
const INITIAL_LAMBDA: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;
const MIN_LAMBDA: f64 = 1e-12;
const MAX_LAMBDA: f64 = 1e12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// One of the function, gradient or parameter tolerances was met.
    Convergence,
    /// `max_iterations` ran out first.
    NoConvergence,
    /// The wall-clock cap ran out first.
    TimeLimit,
}

#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// `None` runs to convergence.
    pub max_time: Option<Duration>,
    pub function_tolerance: f64,
    pub gradient_tolerance: f64,
    pub parameter_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            max_time: None,
            function_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub termination: Termination,
    pub num_residuals: usize,
    pub num_free_variables: usize,
    pub wall_time: Duration,
}

/// Per-block linearization: cost, global columns, weighted Jacobian and residual.
struct Linearized {
    cost: f64,
    columns: Vec<usize>,
    jacobian: DMatrix<f64>,
    residual: DVector<f64>,
}

pub struct LevenbergMarquardt {
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for LevenbergMarquardt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevenbergMarquardt")
            .field("num_threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl LevenbergMarquardt {
    pub fn new(num_threads: usize) -> Result<Self, SolverError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|i| format!("swarmloc-lm-{}", i))
            .build()
            .map_err(|e| SolverError::ThreadPool(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Minimizes the problem in place. Returns an error only for structural
    /// failures; a poor fit is reported through the summary's cost.
    pub fn solve(&self, problem: &mut Problem, options: &SolverOptions) -> Result<SolverSummary, SolverError> {
        let start = Instant::now();

        // --- Variable layout ---
        let mut offsets = Vec::with_capacity(problem.num_parameter_blocks());
        let mut n = 0;
        for block in problem.parameter_blocks() {
            let dof = block.free_dof();
            offsets.push(if dof > 0 { Some((n, dof)) } else { None });
            n += dof;
        }

        let mut values: Vec<PoseParams> = problem.parameter_blocks().iter().map(|b| b.value).collect();
        let residuals = problem.residual_blocks();

        let (mut cost, mut jtj, mut gradient) = self.linearize(residuals, &values, &offsets, n)?;
        let initial_cost = cost;

        let mut lambda = INITIAL_LAMBDA;
        let mut iterations = 0;
        let mut termination = if n == 0 {
            Termination::Convergence
        } else {
            Termination::NoConvergence
        };

        while n > 0 && iterations < options.max_iterations {
            if options.max_time.is_some_and(|limit| start.elapsed() >= limit) {
                termination = Termination::TimeLimit;
                break;
            }
            if gradient.amax() <= options.gradient_tolerance {
                termination = Termination::Convergence;
                break;
            }
            iterations += 1;

            let mut damped = jtj.clone();
            for i in 0..n {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-6);
            }
            let rhs = -&gradient;
            let delta = match damped.clone().cholesky() {
                Some(chol) => chol.solve(&rhs),
                None => match damped.lu().solve(&rhs) {
                    Some(d) => d,
                    None => {
                        lambda *= LAMBDA_UP;
                        if lambda > MAX_LAMBDA {
                            return Err(SolverError::LinearSolveFailed { dim: n });
                        }
                        continue;
                    }
                },
            };

            let x_norm = free_norm(&values, &offsets);
            if delta.norm() <= options.parameter_tolerance * (x_norm + options.parameter_tolerance) {
                termination = Termination::Convergence;
                break;
            }

            let trial = apply_step(&values, &offsets, &delta);
            let trial_cost = self.cost(residuals, &trial);

            if trial_cost < cost {
                let relative_decrease = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
                values = trial;
                lambda = (lambda * LAMBDA_DOWN).max(MIN_LAMBDA);
                (cost, jtj, gradient) = self.linearize(residuals, &values, &offsets, n)?;
                if relative_decrease < options.function_tolerance {
                    termination = Termination::Convergence;
                    break;
                }
            } else {
                lambda *= LAMBDA_UP;
                if lambda > MAX_LAMBDA {
                    // No damping makes progress: we are at a minimum.
                    termination = Termination::Convergence;
                    break;
                }
            }
        }

        for (block, value) in problem.parameter_blocks_mut().iter_mut().zip(values) {
            block.value = value;
        }

        Ok(SolverSummary {
            initial_cost,
            final_cost: cost,
            iterations,
            termination,
            num_residuals: problem.num_residuals(),
            num_free_variables: n,
            wall_time: start.elapsed(),
        })
    }

    /// Total robustified cost `0.5 Σ rho(|r|²)`. Non-finite blocks make the
    /// cost infinite so the trial step is rejected.
    fn cost(&self, residuals: &[ResidualEntry], values: &[PoseParams]) -> f64 {
        self.pool.install(|| {
            residuals
                .par_iter()
                .map(|entry| {
                    let params = gather(entry, values);
                    let mut r = vec![0.0; entry.cost.num_residuals()];
                    entry.cost.evaluate(&params, &mut r);
                    let s: f64 = r.iter().map(|v| v * v).sum();
                    if !s.is_finite() {
                        return f64::INFINITY;
                    }
                    match entry.loss {
                        Some(loss) => 0.5 * loss.evaluate(s).0,
                        None => 0.5 * s,
                    }
                })
                .sum()
        })
    }

    fn linearize(
        &self,
        residuals: &[ResidualEntry],
        values: &[PoseParams],
        offsets: &[Option<(usize, usize)>],
        n: usize,
    ) -> Result<(f64, DMatrix<f64>, DVector<f64>), SolverError> {
        let blocks: Vec<Linearized> = self.pool.install(|| {
            residuals
                .par_iter()
                .enumerate()
                .map(|(i, entry)| linearize_block(i, entry, values, offsets))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let mut cost = 0.0;
        let mut jtj = DMatrix::zeros(n, n);
        let mut gradient = DVector::zeros(n);
        for block in blocks {
            cost += block.cost;
            if block.columns.is_empty() {
                continue;
            }
            let local_jtj = block.jacobian.transpose() * &block.jacobian;
            let local_g = block.jacobian.transpose() * &block.residual;
            for (a, &ca) in block.columns.iter().enumerate() {
                gradient[ca] += local_g[a];
                for (b, &cb) in block.columns.iter().enumerate() {
                    jtj[(ca, cb)] += local_jtj[(a, b)];
                }
            }
        }
        Ok((cost, jtj, gradient))
    }
}

fn gather(entry: &ResidualEntry, values: &[PoseParams]) -> Vec<PoseParams> {
    entry.params.iter().map(|&i| values[i]).collect()
}

fn linearize_block(
    block_index: usize,
    entry: &ResidualEntry,
    values: &[PoseParams],
    offsets: &[Option<(usize, usize)>],
) -> Result<Linearized, SolverError> {
    let m = entry.cost.num_residuals();
    let mut params = gather(entry, values);

    let mut residual = DVector::zeros(m);
    entry.cost.evaluate(&params, residual.as_mut_slice());
    if residual.iter().any(|v| !v.is_finite()) {
        return Err(SolverError::NonFiniteResidual { block: block_index });
    }

    let columns: Vec<usize> = entry
        .params
        .iter()
        .filter_map(|&p| offsets[p])
        .flat_map(|(offset, dof)| offset..offset + dof)
        .collect();

    // --- Central differences over the free entries of each block ---
    let mut jacobian = DMatrix::zeros(m, columns.len());
    let mut plus = vec![0.0; m];
    let mut minus = vec![0.0; m];
    let mut col = 0;
    for (slot, &p) in entry.params.iter().enumerate() {
        let Some((_, dof)) = offsets[p] else {
            continue;
        };
        for c in 0..dof {
            let original = params[slot][c];
            params[slot][c] = original + NUMERIC_DIFF_STEP;
            entry.cost.evaluate(&params, &mut plus);
            params[slot][c] = original - NUMERIC_DIFF_STEP;
            entry.cost.evaluate(&params, &mut minus);
            params[slot][c] = original;
            for row in 0..m {
                jacobian[(row, col)] = (plus[row] - minus[row]) / (2.0 * NUMERIC_DIFF_STEP);
            }
            col += 1;
        }
    }

    let s = residual.norm_squared();
    let cost = match entry.loss {
        Some(loss) => {
            let (rho, d_rho) = loss.evaluate(s);
            let w = d_rho.sqrt();
            residual *= w;
            jacobian *= w;
            0.5 * rho
        }
        None => 0.5 * s,
    };

    Ok(Linearized {
        cost,
        columns,
        jacobian,
        residual,
    })
}

fn free_norm(values: &[PoseParams], offsets: &[Option<(usize, usize)>]) -> f64 {
    values
        .iter()
        .zip(offsets)
        .filter_map(|(v, o)| o.map(|(_, dof)| v[..dof].iter().map(|x| x * x).sum::<f64>()))
        .sum::<f64>()
        .sqrt()
}

fn apply_step(values: &[PoseParams], offsets: &[Option<(usize, usize)>], delta: &DVector<f64>) -> Vec<PoseParams> {
    values
        .iter()
        .zip(offsets)
        .map(|(v, o)| {
            let mut out = *v;
            if let Some((offset, dof)) = o {
                for c in 0..*dof {
                    out[c] += delta[offset + c];
                }
                out[3] = wrap_angle(out[3]);
            }
            out
        })
        .collect()
}
