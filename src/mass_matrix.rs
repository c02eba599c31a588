use itertools::izip;

use crate::{
    math::{multiply, vector_dot},
    nuts::{Collector, SampleInfo},
    state::{InnerState, State},
};

pub(crate) trait MassMatrix {
    fn update_velocity(&self, state: &mut InnerState);
    fn update_kinetic_energy(&self, state: &mut InnerState);
    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R);
}

/// Diagonal mass matrix, stored as its inverse (the posterior variance
/// estimate) together with the inverse standard deviations used to draw
/// momenta.
#[derive(Debug)]
pub(crate) struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    pub(crate) fn new(ndim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; ndim].into(),
            variance: vec![1f64; ndim].into(),
        }
    }

    /// Values that are not finite and positive keep the identity entry.
    pub(crate) fn update_diag(&mut self, new_variance: impl Iterator<Item = f64>) {
        izip!(self.variance.iter_mut(), self.inv_stds.iter_mut(), new_variance).for_each(
            |(var, inv_std, x)| {
                let x = if x.is_finite() && x > 0f64 { x } else { 1f64 };
                *var = x;
                *inv_std = x.recip().sqrt();
            },
        );
    }
}

impl MassMatrix for DiagMassMatrix {
    fn update_velocity(&self, state: &mut InnerState) {
        multiply(&self.variance, &state.p, &mut state.v);
    }

    fn update_kinetic_energy(&self, state: &mut InnerState) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R) {
        let dist = rand_distr::StandardNormal;
        state
            .p
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(dist);
                *p = s * norm;
            });
    }
}

#[derive(Debug)]
pub(crate) struct ExpWeightedVariance {
    mean: Box<[f64]>,
    variance: Box<[f64]>,
    count: u64,
    alpha: f64,
}

impl ExpWeightedVariance {
    pub(crate) fn new(dim: usize, alpha: f64) -> Self {
        ExpWeightedVariance {
            mean: vec![0f64; dim].into(),
            variance: vec![0f64; dim].into(),
            count: 0,
            alpha,
        }
    }

    pub(crate) fn set_mean(&mut self, values: impl Iterator<Item = f64>) {
        self.mean
            .iter_mut()
            .zip(values)
            .for_each(|(out, val)| *out = val);
    }

    pub(crate) fn set_variance(&mut self, values: impl Iterator<Item = f64>) {
        self.variance
            .iter_mut()
            .zip(values)
            .for_each(|(out, val)| *out = val);
    }

    pub(crate) fn add_sample(&mut self, value: impl Iterator<Item = f64>) {
        let alpha = self.alpha;
        izip!(value, self.mean.iter_mut(), self.variance.iter_mut()).for_each(|(x, mean, var)| {
            let delta = x - *mean;
            *mean = alpha.mul_add(delta, *mean);
            *var = (1f64 - alpha) * (*var + alpha * delta * delta);
        });
        self.count += 1;
    }

    pub(crate) fn current(&self) -> &[f64] {
        &self.variance
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Settings for mass matrix adaptation
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DiagAdaptExpSettings {
    /// An exponenital decay parameter for the variance estimator
    pub variance_decay: f64,
    /// Exponenital decay parameter for the variance estimator in the first adaptation window
    pub early_variance_decay: f64,
    /// Stop adaptation `final_window` draws before tuning ends.
    pub final_window: u64,
    /// Switch to a new variance estimator every `window_switch_freq` draws.
    pub window_switch_freq: u64,
    /// Switch after this many draws during the first window.
    pub early_window_switch_freq: u64,
    /// Initialize the mass matrix from the gradient at the initial point.
    pub grad_init: bool,
}

impl Default for DiagAdaptExpSettings {
    fn default() -> Self {
        Self {
            variance_decay: 0.02,
            early_variance_decay: 0.8,
            final_window: 50,
            window_switch_freq: 50,
            early_window_switch_freq: 10,
            grad_init: true,
        }
    }
}

pub(crate) struct DrawGradCollector {
    pub(crate) draw: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) is_good: bool,
}

impl DrawGradCollector {
    pub(crate) fn new(dim: usize) -> Self {
        DrawGradCollector {
            draw: vec![0f64; dim].into(),
            grad: vec![0f64; dim].into(),
            is_good: true,
        }
    }
}

impl Collector for DrawGradCollector {
    fn register_draw(&mut self, state: &State, info: &SampleInfo) {
        self.draw.copy_from_slice(&state.q);
        self.grad.copy_from_slice(&state.grad);
        let idx = state.index_in_trajectory();
        if info.divergence_info.is_some() {
            self.is_good = (idx <= -4) | (idx >= 4);
        } else {
            self.is_good = idx != 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn exp_variance_tracks_constant_shift() {
        let mut est = ExpWeightedVariance::new(1, 0.5);
        est.set_mean([0.].into_iter());
        for _ in 0..50 {
            est.add_sample([2.].into_iter());
        }
        assert_eq!(est.count(), 50);
        assert!(est.current()[0] < 1e-6);
    }

    #[test]
    fn invalid_diag_values_keep_identity() {
        let mut mass = DiagMassMatrix::new(3);
        mass.update_diag([4., f64::NAN, -1.].into_iter());
        assert_eq!(&*mass.variance, &[4., 1., 1.]);
        assert_relative_eq!(mass.inv_stds[0], 0.5);
    }

    #[test]
    fn momentum_scale_follows_mass_matrix() {
        let mut mass = DiagMassMatrix::new(1);
        mass.update_diag([0.25].into_iter());
        let mut pool = crate::state::StatePool::with_capacity(1, 1);
        let mut state = pool.new_state();
        let inner = state.try_mut_inner().unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);

        let n = 20_000;
        let mut sum_sq = 0.;
        for _ in 0..n {
            mass.randomize_momentum(inner, &mut rng);
            sum_sq += inner.p[0] * inner.p[0];
        }
        // Momentum variance is the inverse of the posterior variance.
        assert_relative_eq!(sum_sq / n as f64, 4., max_relative = 0.05);

        mass.update_velocity(inner);
        mass.update_kinetic_energy(inner);
        assert_relative_eq!(inner.v[0], 0.25 * inner.p[0]);
        assert_relative_eq!(inner.kinetic_energy, 0.5 * 0.25 * inner.p[0] * inner.p[0]);
    }
}
