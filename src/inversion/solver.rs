//! Damped Gauss-Newton (Levenberg-Marquardt) with optional Huber weighting.

use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};

use crate::config::SolverConfig;

/// Marquardt scaling floor for diagonal entries of a flat direction.
const DAMPING_FLOOR: f64 = 1e-12;
const LAMBDA_MIN: f64 = 1e-15;
const LAMBDA_MAX: f64 = 1e15;

/// A least-squares problem in internal coordinates.
pub(crate) trait ResidualModel {
    fn residuals(&mut self, x: &DVector<f64>) -> DVector<f64>;

    /// Map `x` back into the admissible region.
    fn project(&self, _x: &mut DVector<f64>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stop {
    Converged,
    IterationLimit,
    Timeout,
    NonFinite,
    /// Every trial step was rejected up to the largest damping
    Stalled,
}

#[derive(Debug, Clone)]
pub(crate) struct LmOutcome {
    pub x: DVector<f64>,
    pub residuals: DVector<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub stop: Stop,
    /// `s^2 (J^T W J)^-1`, absent without redundancy or for a singular system
    pub covariance: Option<DMatrix<f64>>,
}

fn loss_cost(r: f64, huber: Option<f64>) -> f64 {
    match huber {
        Some(delta) if r.abs() > delta => 2.0 * delta * r.abs() - delta * delta,
        _ => r * r,
    }
}

fn loss_weight(r: f64, huber: Option<f64>) -> f64 {
    match huber {
        Some(delta) if r.abs() > delta => delta / r.abs(),
        _ => 1.0,
    }
}

fn total_cost(residuals: &DVector<f64>, huber: Option<f64>) -> f64 {
    residuals.iter().map(|&r| loss_cost(r, huber)).sum()
}

/// Solve a symmetric normal system, Cholesky first and LU when the matrix is
/// not numerically positive definite.
pub(crate) fn solve_normal_equation(normal: DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    if let Some(chol) = normal.clone().cholesky() {
        return Some(chol.solve(rhs));
    }
    normal.lu().solve(rhs)
}

fn jacobian<M: ResidualModel>(
    model: &mut M,
    x: &DVector<f64>,
    r0: &DVector<f64>,
    fd_step: f64,
) -> DMatrix<f64> {
    let mut jac = DMatrix::zeros(r0.len(), x.len());
    for j in 0..x.len() {
        let h = fd_step * (1.0 + x[j].abs());
        let mut shifted = x.clone();
        shifted[j] += h;
        let column = (model.residuals(&shifted) - r0) / h;
        jac.set_column(j, &column);
    }
    jac
}

/// `(J^T W J, J^T W r)` with Huber weights taken from the current residuals.
fn weighted_normal(
    jac: &DMatrix<f64>,
    residuals: &DVector<f64>,
    huber: Option<f64>,
) -> (DMatrix<f64>, DVector<f64>) {
    let mut weighted = jac.clone();
    for (i, &r) in residuals.iter().enumerate() {
        weighted.row_mut(i).scale_mut(loss_weight(r, huber));
    }
    let normal = jac.transpose() * &weighted;
    let gradient = weighted.transpose() * residuals;
    (normal, gradient)
}

fn covariance(
    jac: &DMatrix<f64>,
    residuals: &DVector<f64>,
    cost: f64,
    huber: Option<f64>,
) -> Option<DMatrix<f64>> {
    let (m, p) = jac.shape();
    if m <= p {
        return None;
    }
    let s2 = cost / (m - p) as f64;
    let (normal, _) = weighted_normal(jac, residuals, huber);
    normal.try_inverse().map(|inv| inv * s2)
}

pub(crate) fn levenberg_marquardt<M: ResidualModel>(
    model: &mut M,
    mut x: DVector<f64>,
    config: &SolverConfig,
) -> LmOutcome {
    let start = Instant::now();
    let budget = config.timeout_secs.map(Duration::from_secs_f64);
    let huber = config.huber_delta;
    let tol = config.tolerance;

    model.project(&mut x);
    let mut residuals = model.residuals(&x);
    let mut cost = total_cost(&residuals, huber);
    if !cost.is_finite() {
        return LmOutcome {
            x,
            residuals,
            cost,
            iterations: 0,
            stop: Stop::NonFinite,
            covariance: None,
        };
    }

    let mut jac = jacobian(model, &x, &residuals, config.fd_step);
    let mut lambda = config.lambda_init;
    let mut iterations = 0;
    let mut stop = Stop::IterationLimit;

    while iterations < config.max_iterations {
        if cost < tol * tol {
            stop = Stop::Converged;
            break;
        }
        if budget.is_some_and(|b| start.elapsed() > b) {
            stop = Stop::Timeout;
            break;
        }
        iterations += 1;

        let (normal, gradient) = weighted_normal(&jac, &residuals, huber);
        let mut damped = normal.clone();
        for i in 0..x.len() {
            damped[(i, i)] += lambda * normal[(i, i)].max(DAMPING_FLOOR);
        }
        let Some(step) = solve_normal_equation(damped, &(-gradient)) else {
            lambda = (lambda * config.lambda_up).min(LAMBDA_MAX);
            continue;
        };

        let mut trial = &x + &step;
        model.project(&mut trial);
        let step_norm = (&trial - &x).norm();
        let small_step = step_norm <= tol * (x.norm() + tol);
        let trial_residuals = model.residuals(&trial);
        let trial_cost = total_cost(&trial_residuals, huber);

        if trial_cost.is_finite() && trial_cost < cost {
            let decrease = (cost - trial_cost) / cost;
            x = trial;
            residuals = trial_residuals;
            cost = trial_cost;
            lambda = (lambda * config.lambda_down).max(LAMBDA_MIN);
            jac = jacobian(model, &x, &residuals, config.fd_step);
            if decrease <= tol || small_step {
                stop = Stop::Converged;
                break;
            }
        } else {
            // No descent left along a vanishing step: stationary point.
            if small_step {
                stop = Stop::Converged;
                break;
            }
            if lambda >= LAMBDA_MAX {
                stop = Stop::Stalled;
                break;
            }
            lambda = (lambda * config.lambda_up).min(LAMBDA_MAX);
        }
    }

    if stop == Stop::IterationLimit && cost < tol * tol {
        stop = Stop::Converged;
    }

    let covariance = covariance(&jac, &residuals, cost, huber);
    LmOutcome {
        x,
        residuals,
        cost,
        iterations,
        stop,
        covariance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// `y = a / (1 + k t)` observed in log space, `x = (ln a, k)`.
    struct Hyperbolic {
        t: Vec<f64>,
        ln_y: Vec<f64>,
        sleep: Option<Duration>,
    }

    impl Hyperbolic {
        fn new(a: f64, k: f64) -> Self {
            let t: Vec<f64> = (0..40).map(|i| 0.25 * i as f64).collect();
            let ln_y = t.iter().map(|&t| (a / (1.0 + k * t)).ln()).collect();
            Self {
                t,
                ln_y,
                sleep: None,
            }
        }
    }

    impl ResidualModel for Hyperbolic {
        fn residuals(&mut self, x: &DVector<f64>) -> DVector<f64> {
            if let Some(pause) = self.sleep {
                std::thread::sleep(pause);
            }
            DVector::from_iterator(
                self.t.len(),
                self.t
                    .iter()
                    .zip(&self.ln_y)
                    .map(|(&t, &ln_y)| ln_y - (x[0] - (1.0 + x[1] * t).ln())),
            )
        }

        fn project(&self, x: &mut DVector<f64>) {
            x[1] = x[1].max(0.0);
        }
    }

    #[test]
    fn recovers_noise_free_parameters() {
        let mut problem = Hyperbolic::new(50.0, 0.8);
        let out = levenberg_marquardt(
            &mut problem,
            DVector::from_vec(vec![1.0, 0.1]),
            &SolverConfig::default(),
        );
        assert_eq!(out.stop, Stop::Converged);
        assert_relative_eq!(out.x[0].exp(), 50.0, max_relative = 1e-6);
        assert_relative_eq!(out.x[1], 0.8, max_relative = 1e-6);
        assert!(out.cost < 1e-12);
    }

    #[test]
    fn covariance_scales_with_noise() {
        let mut problem = Hyperbolic::new(10.0, 0.5);
        for (i, v) in problem.ln_y.iter_mut().enumerate() {
            *v += if i % 2 == 0 { 0.05 } else { -0.05 };
        }
        let out = levenberg_marquardt(
            &mut problem,
            DVector::from_vec(vec![2.0, 0.5]),
            &SolverConfig::default(),
        );
        let cov = out.covariance.expect("redundant system has a covariance");
        assert!(cov[(0, 0)] > 0.0 && cov[(1, 1)] > 0.0);
        assert!(cov[(0, 0)].sqrt() < 0.1);
    }

    #[test]
    fn huber_limits_outlier_pull() {
        let mut plain = Hyperbolic::new(10.0, 0.5);
        plain.ln_y[20] += 3.0;
        let mut robust = Hyperbolic {
            t: plain.t.clone(),
            ln_y: plain.ln_y.clone(),
            sleep: None,
        };
        let x0 = DVector::from_vec(vec![2.0, 0.3]);

        let ls = levenberg_marquardt(&mut plain, x0.clone(), &SolverConfig::default());
        let huber_cfg = SolverConfig {
            huber_delta: Some(0.1),
            ..SolverConfig::default()
        };
        let hb = levenberg_marquardt(&mut robust, x0, &huber_cfg);

        let truth = 10.0f64.ln();
        assert!((hb.x[0] - truth).abs() < (ls.x[0] - truth).abs());
    }

    #[test]
    fn iteration_budget_is_reported() {
        let mut problem = Hyperbolic::new(50.0, 0.8);
        let cfg = SolverConfig {
            max_iterations: 1,
            ..SolverConfig::default()
        };
        let out = levenberg_marquardt(&mut problem, DVector::from_vec(vec![0.0, 5.0]), &cfg);
        assert_eq!(out.stop, Stop::IterationLimit);
        assert_eq!(out.iterations, 1);
    }

    /// Residuals jump up at every point but the start, so no step can ever
    /// be accepted.
    struct Spike;

    impl ResidualModel for Spike {
        fn residuals(&mut self, x: &DVector<f64>) -> DVector<f64> {
            let level = if x[0] == 0.0 { 1.0 } else { 2.0 };
            DVector::from_element(2, level)
        }
    }

    #[test]
    fn saturated_damping_is_not_convergence() {
        let cfg = SolverConfig {
            tolerance: 0.0,
            ..SolverConfig::default()
        };
        let out = levenberg_marquardt(&mut Spike, DVector::from_vec(vec![0.0]), &cfg);
        assert_eq!(out.stop, Stop::Stalled);
        assert!(out.iterations < cfg.max_iterations);
        assert_eq!(out.x[0], 0.0);
    }

    #[test]
    fn wall_clock_budget_stops_the_fit() {
        let mut problem = Hyperbolic::new(50.0, 0.8);
        problem.sleep = Some(Duration::from_millis(2));
        let cfg = SolverConfig {
            timeout_secs: Some(1e-3),
            ..SolverConfig::default()
        };
        let out = levenberg_marquardt(&mut problem, DVector::from_vec(vec![0.0, 5.0]), &cfg);
        assert_eq!(out.stop, Stop::Timeout);
    }

    #[test]
    fn cholesky_and_lu_agree() {
        let normal = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let rhs = DVector::from_vec(vec![1.0, 2.0]);
        let sol = solve_normal_equation(normal.clone(), &rhs).unwrap();
        let lu = normal.lu().solve(&rhs).unwrap();
        assert_relative_eq!(sol, lu, epsilon = 1e-12);
    }
}
