use rand::Rng;

use crate::{
    adapt_strategy::CombinedCollector,
    hamiltonian::{DivergenceInfo, Hamiltonian},
    nuts::{draw, Collector, NutsError, NutsOptions},
    state::{State, StatePool},
    stepsize::AcceptanceRateCollector,
};

/// Draw samples from the posterior distribution using Hamiltonian MCMC.
pub trait Chain {
    /// Initialize the sampler to a position. This should be called
    /// before calling draw.
    ///
    /// This fails if the logp function returns an error.
    fn set_position(&mut self, position: &[f64]) -> Result<(), NutsError>;

    /// Draw a new sample and return the position and some diagnosic information.
    fn draw(&mut self) -> Result<(Box<[f64]>, DrawStats), NutsError>;

    /// The dimensionality of the posterior.
    fn dim(&self) -> usize;
}

/// Statistics about one draw of a chain.
#[derive(Debug, Clone)]
pub struct DrawStats {
    /// Depth of the trajectory tree
    pub depth: u64,
    /// The trajectory was stopped by the maximum tree depth
    pub maxdepth_reached: bool,
    pub diverging: bool,
    pub index_in_trajectory: i64,
    pub logp: f64,
    pub energy: f64,
    /// Step size used for this draw
    pub step_size: f64,
    /// Mean acceptance probability over the leapfrog steps of the trajectory
    pub mean_tree_accept: f64,
    /// Number of leapfrog steps
    pub n_steps: u64,
    /// The draw was made during warm-up
    pub tuning: bool,
    pub chain: u64,
    pub draw: u64,
    pub divergence_info: Option<DivergenceInfo>,
}

pub(crate) trait AdaptStrategy {
    type Hamiltonian: Hamiltonian;
    type Collector: Collector;
    type Options: Copy + Send + Default;

    fn new(options: Self::Options, num_tune: u64, dim: usize) -> Self;

    fn init<R: Rng + ?Sized>(
        &mut self,
        options: &mut NutsOptions,
        hamiltonian: &mut Self::Hamiltonian,
        state: &State,
        rng: &mut R,
    );

    fn adapt(
        &mut self,
        options: &mut NutsOptions,
        hamiltonian: &mut Self::Hamiltonian,
        draw: u64,
        collector: &Self::Collector,
    );

    fn new_collector(&self) -> Self::Collector;
}

pub(crate) struct NutsChain<R, A>
where
    R: Rng,
    A: AdaptStrategy,
{
    pool: StatePool,
    hamiltonian: A::Hamiltonian,
    collector: CombinedCollector<AcceptanceRateCollector, A::Collector>,
    options: NutsOptions,
    rng: R,
    state: Option<State>,
    chain: u64,
    draw_count: u64,
    num_tune: u64,
    strategy: A,
}

impl<R, A> NutsChain<R, A>
where
    R: Rng,
    A: AdaptStrategy,
{
    pub(crate) fn new(
        mut hamiltonian: A::Hamiltonian,
        strategy: A,
        options: NutsOptions,
        rng: R,
        chain: u64,
        num_tune: u64,
    ) -> Self {
        let pool_size = usize::try_from(options.maxdepth.saturating_mul(2)).unwrap_or(64);
        let pool = hamiltonian.new_pool(pool_size);
        let collector = CombinedCollector {
            collector1: AcceptanceRateCollector::new(),
            collector2: strategy.new_collector(),
        };
        NutsChain {
            pool,
            hamiltonian,
            collector,
            options,
            rng,
            state: None,
            chain,
            draw_count: 0,
            num_tune,
            strategy,
        }
    }
}

impl<R, A> Chain for NutsChain<R, A>
where
    R: Rng,
    A: AdaptStrategy,
{
    fn set_position(&mut self, position: &[f64]) -> Result<(), NutsError> {
        let state = self.hamiltonian.init_state(&mut self.pool, position)?;
        self.strategy.init(
            &mut self.options,
            &mut self.hamiltonian,
            &state,
            &mut self.rng,
        );
        self.state = Some(state);
        Ok(())
    }

    fn draw(&mut self) -> Result<(Box<[f64]>, DrawStats), NutsError> {
        let init = self.state.as_mut().ok_or(NutsError::NotInitialized)?;
        let step_size = self.hamiltonian.step_size();
        let (state, info) = draw(
            &mut self.pool,
            init,
            &mut self.rng,
            &mut self.hamiltonian,
            &self.options,
            &mut self.collector,
        )?;
        let position: Box<[f64]> = state.q.clone();
        let tuning = self.draw_count < self.num_tune;

        let stats = DrawStats {
            depth: info.depth,
            maxdepth_reached: info.reached_maxdepth,
            diverging: info.divergence_info.is_some(),
            index_in_trajectory: state.index_in_trajectory(),
            logp: -state.potential_energy,
            energy: state.energy(),
            step_size,
            mean_tree_accept: self.collector.collector1.mean.current(),
            n_steps: self.collector.collector1.mean.count(),
            tuning,
            chain: self.chain,
            draw: self.draw_count,
            divergence_info: info.divergence_info,
        };

        if tuning {
            self.strategy.adapt(
                &mut self.options,
                &mut self.hamiltonian,
                self.draw_count,
                &self.collector.collector2,
            );
        }
        self.draw_count += 1;
        self.state = Some(state);
        Ok((position, stats))
    }

    fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }
}
