use std::sync::Arc;

use crate::{
    hamiltonian::{Direction, DivergenceInfo, Hamiltonian, LeapfrogResult, LogpError},
    mass_matrix::MassMatrix,
    nuts::{Collector, NutsError},
    state::{InnerState, State, StatePool},
};

/// A log density with gradient, evaluated on the unconstrained scale.
pub trait CpuLogpFunc {
    type LogpError: LogpError;

    /// Number of parameters.
    fn dim(&self) -> usize;

    /// Compute the log density at `position` and write its gradient
    /// into `grad`.
    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError>;
}

/// Hamiltonian with a position independent (Euclidean) kinetic energy.
pub(crate) struct EuclideanHamiltonian<F: CpuLogpFunc, M: MassMatrix> {
    logp: F,
    pub(crate) mass_matrix: M,
    max_energy_error: f64,
    step_size: f64,
}

impl<F: CpuLogpFunc, M: MassMatrix> EuclideanHamiltonian<F, M> {
    pub(crate) fn new(logp: F, mass_matrix: M, max_energy_error: f64, step_size: f64) -> Self {
        EuclideanHamiltonian {
            logp,
            mass_matrix,
            max_energy_error,
            step_size,
        }
    }

    fn update_potential_gradient(&mut self, state: &mut InnerState) -> Result<(), F::LogpError> {
        let logp = self.logp.logp(&state.q, &mut state.grad)?;
        state.potential_energy = -logp;
        Ok(())
    }
}

impl<F: CpuLogpFunc, M: MassMatrix> Hamiltonian for EuclideanHamiltonian<F, M> {
    type LogpError = F::LogpError;

    fn leapfrog<C: Collector>(
        &mut self,
        pool: &mut StatePool,
        start: &State,
        dir: Direction,
        collector: &mut C,
    ) -> LeapfrogResult<Self::LogpError> {
        let mut out = pool.new_state();
        let Ok(out_inner) = out.try_mut_inner() else {
            unreachable!("fresh states from the pool are never shared");
        };

        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };

        let epsilon = (sign as f64) * self.step_size;

        out_inner.initial_energy = start.initial_energy;
        start.first_momentum_halfstep(out_inner, epsilon);
        self.mass_matrix.update_velocity(out_inner);

        start.position_step(out_inner, epsilon);
        if let Err(logp_error) = self.update_potential_gradient(out_inner) {
            if !logp_error.is_recoverable() {
                return LeapfrogResult::Err(logp_error);
            }
            let div_info = DivergenceInfo {
                start_location: Some(start.q.clone()),
                end_location: None,
                energy_error: None,
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: None,
                logp_function_error: Some(Arc::new(logp_error)),
            };
            collector.register_leapfrog(start, &out, Some(&div_info));
            return LeapfrogResult::Divergence(div_info);
        }

        out_inner.second_momentum_halfstep(epsilon);

        self.mass_matrix.update_velocity(out_inner);
        self.mass_matrix.update_kinetic_energy(out_inner);

        out_inner.idx_in_trajectory = start.index_in_trajectory() + sign;

        start.set_psum(out_inner);

        let energy_error = out.energy() - out.initial_energy;
        if (energy_error > self.max_energy_error) | !energy_error.is_finite() {
            let divergence_info = DivergenceInfo {
                start_location: Some(start.q.clone()),
                end_location: Some(out.q.clone()),
                energy_error: Some(energy_error),
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: Some(out.index_in_trajectory()),
                logp_function_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&divergence_info));
            return LeapfrogResult::Divergence(divergence_info);
        }

        collector.register_leapfrog(start, &out, None);

        LeapfrogResult::Ok(out)
    }

    fn init_state(&mut self, pool: &mut StatePool, init: &[f64]) -> Result<State, NutsError> {
        let mut state = pool.new_state();
        let Ok(inner) = state.try_mut_inner() else {
            unreachable!("fresh states from the pool are never shared");
        };
        inner.q.copy_from_slice(init);
        inner.p_sum.fill(0.);
        inner.idx_in_trajectory = 0;

        if let Err(err) = self.update_potential_gradient(inner) {
            return Err(if err.is_recoverable() {
                NutsError::BadInitLogp(Box::new(err))
            } else {
                NutsError::LogpFailure(Box::new(err))
            });
        }
        if !inner.potential_energy.is_finite()
            || !inner.grad.iter().all(|&g| g.is_finite() && g != 0.)
        {
            return Err(NutsError::BadInitGrad());
        }
        Ok(state)
    }

    fn initialize_trajectory<R: rand::Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        let Ok(inner) = state.try_mut_inner() else {
            unreachable!("the chain holds the only reference to its current state");
        };
        self.mass_matrix.randomize_momentum(inner, rng);
        self.mass_matrix.update_velocity(inner);
        self.mass_matrix.update_kinetic_energy(inner);
        inner.idx_in_trajectory = 0;
        inner.initial_energy = inner.kinetic_energy + inner.potential_energy;
        inner.p_sum.copy_from_slice(&inner.p);
    }

    fn new_pool(&mut self, capacity: usize) -> StatePool {
        StatePool::with_capacity(self.dim(), capacity)
    }

    fn dim(&self) -> usize {
        self.logp.dim()
    }

    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn step_size_mut(&mut self) -> &mut f64 {
        &mut self.step_size
    }
}
