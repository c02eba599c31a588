//! The coinflip posterior: a Beta prior on the probability of heads and a
//! Binomial likelihood for the number of heads.

use num_traits::Float;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

use crate::math::log_sigmoid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("the number of flips must be positive")]
    NoFlips,
    #[error("the probability of heads must lie strictly between 0 and 1, got {0}")]
    InvalidProbability(f64),
    #[error("can not build a coinflip problem from an empty observation sequence")]
    EmptyObservations,
    #[error("prior parameters must be finite and > 0, got alpha={alpha}, beta={beta}")]
    InvalidPrior { alpha: f64, beta: f64 },
    #[error("the number of heads ({heads}) exceeds the number of flips ({flips})")]
    InvalidCounts { flips: u64, heads: u64 },
}

#[inline]
fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

fn ln_choose(n: u64, k: u64) -> f64 {
    let n1 = (n as f64) + 1.0;
    let k1 = (k as f64) + 1.0;
    let nk1 = ((n - k) as f64) + 1.0;
    ln_gamma(n1) - ln_gamma(k1) - ln_gamma(nk1)
}

/// Beta prior on the probability of heads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaPrior {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for BetaPrior {
    fn default() -> Self {
        Self {
            alpha: 2.0,
            beta: 2.0,
        }
    }
}

impl BetaPrior {
    pub fn new(alpha: f64, beta: f64) -> Result<Self, ModelError> {
        let prior = Self { alpha, beta };
        prior.validate()?;
        Ok(prior)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let valid = |x: f64| x.is_finite() && x > 0.0;
        if valid(self.alpha) && valid(self.beta) {
            Ok(())
        } else {
            Err(ModelError::InvalidPrior {
                alpha: self.alpha,
                beta: self.beta,
            })
        }
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn sd(&self) -> f64 {
        let total = self.alpha + self.beta;
        (self.alpha * self.beta / (total * total * (total + 1.0))).sqrt()
    }
}

/// The parameter record of the model, in model space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub p: f64,
}

/// Sufficient statistics of a sequence of coinflips together with the prior.
///
/// Always holds `0 <= heads <= flips` and `flips > 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct CoinflipProblem {
    flips: u64,
    heads: u64,
    prior: BetaPrior,
    /// Normalization of the prior plus the binomial coefficient.
    ln_norm: f64,
}

impl CoinflipProblem {
    /// Reduce observations to their counts, with the default `Beta(2, 2)` prior.
    pub fn new(data: &[bool]) -> Result<Self, ModelError> {
        Self::with_prior(data, BetaPrior::default())
    }

    pub fn with_prior(data: &[bool], prior: BetaPrior) -> Result<Self, ModelError> {
        if data.is_empty() {
            return Err(ModelError::EmptyObservations);
        }
        let heads = data.iter().filter(|&&flip| flip).count() as u64;
        Self::from_counts(data.len() as u64, heads, prior)
    }

    pub fn from_counts(flips: u64, heads: u64, prior: BetaPrior) -> Result<Self, ModelError> {
        if flips == 0 {
            return Err(ModelError::EmptyObservations);
        }
        if heads > flips {
            return Err(ModelError::InvalidCounts { flips, heads });
        }
        prior.validate()?;
        Ok(Self {
            flips,
            heads,
            prior,
            ln_norm: ln_choose(flips, heads) - ln_beta(prior.alpha, prior.beta),
        })
    }

    pub fn flips(&self) -> u64 {
        self.flips
    }

    pub fn heads(&self) -> u64 {
        self.heads
    }

    pub fn prior(&self) -> BetaPrior {
        self.prior
    }

    /// Exponents of `p` and `1 - p` in the unnormalized posterior.
    fn exponents(&self) -> (f64, f64) {
        let heads = self.heads as f64;
        let tails = (self.flips - self.heads) as f64;
        (self.prior.alpha - 1.0 + heads, self.prior.beta - 1.0 + tails)
    }

    /// Log prior plus log likelihood at `p`.
    ///
    /// Generic over the float type so that it can be evaluated with dual
    /// numbers. Returns negative infinity outside of `(0, 1)`.
    pub fn log_density<T: Float>(&self, p: T) -> T {
        let zero = T::zero();
        let one = T::one();
        if !(p > zero && p < one) {
            return T::neg_infinity();
        }
        let (a, b) = self.exponents();
        let (Some(ln_norm), Some(a), Some(b)) = (T::from(self.ln_norm), T::from(a), T::from(b))
        else {
            return T::nan();
        };
        ln_norm + a * p.ln() + b * (-p).ln_1p()
    }

    pub fn log_density_params(&self, params: &Params) -> f64 {
        self.log_density(params.p)
    }

    /// Derivative of `log_density` with respect to `p`.
    pub fn grad_log_density(&self, p: f64) -> f64 {
        let (a, b) = self.exponents();
        a / p - b / (1.0 - p)
    }

    /// `log_density(sigmoid(x))`, evaluated without rounding `p` to 0 or 1.
    pub fn log_density_logit(&self, x: f64) -> f64 {
        let (a, b) = self.exponents();
        self.ln_norm + a * log_sigmoid(x) + b * log_sigmoid(-x)
    }

    /// Parameters of the conjugate `Beta` posterior.
    pub fn posterior(&self) -> BetaPrior {
        BetaPrior {
            alpha: self.prior.alpha + self.heads as f64,
            beta: self.prior.beta + (self.flips - self.heads) as f64,
        }
    }

    pub fn posterior_mean(&self) -> f64 {
        self.posterior().mean()
    }

    pub fn posterior_sd(&self) -> f64 {
        self.posterior().sd()
    }
}
