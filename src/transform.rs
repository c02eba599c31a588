//! Logit reparameterization of the coinflip posterior.
//!
//! The sampler works on `x` in the whole real line, the model on
//! `p = sigmoid(x)` in `(0, 1)`.

use thiserror::Error;

use crate::{
    euclidean_hamiltonian::CpuLogpFunc,
    hamiltonian::LogpError,
    math::{log_sigmoid, sigmoid},
    model::CoinflipProblem,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("log density is not finite at x={x}: logp={logp}, grad={grad}")]
    NonFinite { x: f64, logp: f64, grad: f64 },
    #[error("the coinflip posterior has one parameter, got a position of length {0}")]
    DimensionMismatch(usize),
}

impl LogpError for TransformError {
    fn is_recoverable(&self) -> bool {
        matches!(self, TransformError::NonFinite { .. })
    }
}

/// `(-inf, inf) -> (0, 1)`, `p = sigmoid(x)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogitTransform;

impl LogitTransform {
    #[inline]
    pub fn to_constrained(&self, x: f64) -> f64 {
        sigmoid(x)
    }

    #[inline]
    pub fn to_unconstrained(&self, p: f64) -> f64 {
        p.ln() - (-p).ln_1p()
    }

    /// `ln |dp/dx| = ln sigmoid(x) + ln sigmoid(-x)`
    #[inline]
    pub fn log_abs_det_jacobian(&self, x: f64) -> f64 {
        log_sigmoid(x) + log_sigmoid(-x)
    }

    /// `d/dx ln |dp/dx| = 1 - 2 sigmoid(x)`
    #[inline]
    pub fn grad_log_abs_det_jacobian(&self, x: f64) -> f64 {
        1.0 - 2.0 * sigmoid(x)
    }
}

/// The coinflip posterior on the unconstrained scale, including the
/// log Jacobian of the logit transform.
#[derive(Debug, Clone)]
pub struct TransformedPosterior {
    problem: CoinflipProblem,
    transform: LogitTransform,
}

impl TransformedPosterior {
    pub fn new(problem: CoinflipProblem) -> Self {
        Self {
            problem,
            transform: LogitTransform,
        }
    }

    pub fn problem(&self) -> &CoinflipProblem {
        &self.problem
    }

    pub fn transform(&self) -> LogitTransform {
        self.transform
    }

    /// Log density and its derivative at the unconstrained point `x`.
    ///
    /// With `n` flips, `y` heads and a `Beta(a, b)` prior the gradient is
    /// `(a + y) (1 - p) - (b + n - y) p`.
    pub fn evaluate_with_gradient(&self, x: f64) -> Result<(f64, f64), TransformError> {
        let logp = self.problem.log_density_logit(x) + self.transform.log_abs_det_jacobian(x);

        let prior = self.problem.prior();
        let heads = self.problem.heads() as f64;
        let tails = (self.problem.flips() - self.problem.heads()) as f64;
        let grad = (prior.alpha + heads) * sigmoid(-x) - (prior.beta + tails) * sigmoid(x);

        if !(logp.is_finite() && grad.is_finite()) {
            return Err(TransformError::NonFinite { x, logp, grad });
        }
        Ok((logp, grad))
    }
}

impl CpuLogpFunc for TransformedPosterior {
    type LogpError = TransformError;

    fn dim(&self) -> usize {
        1
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, TransformError> {
        let (&[x], [g]) = (position, grad) else {
            return Err(TransformError::DimensionMismatch(position.len()));
        };
        let (logp, dlogp) = self.evaluate_with_gradient(x)?;
        *g = dlogp;
        Ok(logp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BetaPrior;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn posterior(flips: u64, heads: u64) -> TransformedPosterior {
        TransformedPosterior::new(
            CoinflipProblem::from_counts(flips, heads, BetaPrior::default()).unwrap(),
        )
    }

    #[test]
    fn includes_jacobian() {
        let post = posterior(100, 70);
        let t = LogitTransform;
        for x in [-2.0, -0.1, 0.0, 0.8, 3.0] {
            let (logp, _) = post.evaluate_with_gradient(x).unwrap();
            let expected =
                post.problem().log_density(t.to_constrained(x)) + t.log_abs_det_jacobian(x);
            assert_relative_eq!(logp, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let post = posterior(100, 70);
        let h = 1e-6;
        for x in [-1.0, 0.0, 0.85, 2.0] {
            let (_, grad) = post.evaluate_with_gradient(x).unwrap();
            let (up, _) = post.evaluate_with_gradient(x + h).unwrap();
            let (down, _) = post.evaluate_with_gradient(x - h).unwrap();
            assert_relative_eq!(grad, (up - down) / (2.0 * h), epsilon = 1e-4);
        }
    }

    #[test]
    fn gradient_is_chain_rule_of_model_gradient() {
        let post = posterior(100, 70);
        let t = LogitTransform;
        let x = t.to_unconstrained(0.5);
        let p = t.to_constrained(x);
        let (_, grad) = post.evaluate_with_gradient(x).unwrap();
        let chain = post.problem().grad_log_density(p) * p * (1.0 - p)
            + t.grad_log_abs_det_jacobian(x);
        assert_relative_eq!(grad, chain, epsilon = 1e-9);
    }

    #[test]
    fn non_finite_input_is_recoverable() {
        let post = posterior(10, 3);
        let err = post.evaluate_with_gradient(f64::NAN).unwrap_err();
        assert!(err.is_recoverable());
        let err = post.evaluate_with_gradient(f64::INFINITY).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn logp_func_checks_dimension() {
        let mut post = posterior(10, 3);
        assert_eq!(post.dim(), 1);
        let mut grad = [0.0; 2];
        let err = post.logp(&[0.0, 1.0], &mut grad).unwrap_err();
        assert_eq!(err, TransformError::DimensionMismatch(2));
        assert!(!err.is_recoverable());

        let mut grad = [0.0];
        let logp = post.logp(&[0.3], &mut grad).unwrap();
        let (expected, expected_grad) = post.evaluate_with_gradient(0.3).unwrap();
        assert_eq!(logp, expected);
        assert_eq!(grad[0], expected_grad);
    }

    proptest! {
        #[test]
        fn round_trip_constrained(p in 1e-6f64..(1.0 - 1e-6)) {
            let t = LogitTransform;
            let back = t.to_constrained(t.to_unconstrained(p));
            prop_assert!((back - p).abs() < 1e-12);
        }

        #[test]
        fn round_trip_unconstrained(x in -15f64..15f64) {
            let t = LogitTransform;
            let back = t.to_unconstrained(t.to_constrained(x));
            prop_assert!((back - x).abs() < 1e-6 * x.abs().max(1.0));
        }
    }
}
