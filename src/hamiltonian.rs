use std::sync::Arc;

use rand_distr::{Distribution, StandardUniform};

use crate::{
    nuts::{Collector, NutsError},
    state::{State, StatePool},
};

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value or nan.
/// - The logp function caused a recoverable error (eg a non-finite
///   density at the proposed point)
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_location: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub end_idx_in_trajectory: Option<i64>,
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync + 'static {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

pub(crate) enum LeapfrogResult<E> {
    Ok(State),
    Divergence(DivergenceInfo),
    Err(E),
}

/// The hamiltonian defined by the potential energy and the kinetic energy
pub(crate) trait Hamiltonian {
    /// Errors that happen during logp evaluation
    type LogpError: LogpError;

    /// Perform one leapfrog step.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    fn leapfrog<C: Collector>(
        &mut self,
        pool: &mut StatePool,
        start: &State,
        dir: Direction,
        collector: &mut C,
    ) -> LeapfrogResult<Self::LogpError>;

    /// Initialize a state at a new location.
    ///
    /// The momentum is left at zero, it will later be set using
    /// `Self::initialize_trajectory`.
    fn init_state(&mut self, pool: &mut StatePool, init: &[f64]) -> Result<State, NutsError>;

    /// Draw a new momentum and make the state the first point of a trajectory.
    fn initialize_trajectory<R: rand::Rng + ?Sized>(&self, state: &mut State, rng: &mut R);

    /// Crate a new state pool that can be used to crate new states.
    fn new_pool(&mut self, capacity: usize) -> StatePool;

    /// The dimension of the hamiltonian (position only).
    fn dim(&self) -> usize;

    fn step_size(&self) -> f64;
    fn step_size_mut(&mut self) -> &mut f64;
}
