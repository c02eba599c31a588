use std::{iter, marker::PhantomData};

use itertools::izip;
use rand::Rng;

use crate::{
    chain::AdaptStrategy,
    euclidean_hamiltonian::{CpuLogpFunc, EuclideanHamiltonian},
    hamiltonian::{Direction, DivergenceInfo, Hamiltonian, LeapfrogResult},
    mass_matrix::{DiagAdaptExpSettings, DiagMassMatrix, DrawGradCollector, ExpWeightedVariance},
    nuts::{Collector, NutsOptions, SampleInfo},
    state::State,
    stepsize::{AcceptanceRateCollector, DualAverage, DualAverageOptions},
};

const LOWER_LIMIT: f64 = 1e-10f64;
const UPPER_LIMIT: f64 = 1e10f64;

/// Step size adaptation settings
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DualAverageSettings {
    /// Acceptance rate targeted at the very start of warm-up
    pub early_target_accept: f64,
    pub target_accept: f64,
    /// Fraction of the warm-up during which the target moves from
    /// `early_target_accept` to `target_accept`
    pub final_window_ratio: f64,
    pub initial_step: f64,
    pub params: DualAverageOptions,
}

impl Default for DualAverageSettings {
    fn default() -> Self {
        Self {
            early_target_accept: 0.5,
            target_accept: 0.8,
            final_window_ratio: 0.4,
            initial_step: 0.1,
            params: DualAverageOptions::default(),
        }
    }
}

pub(crate) struct DualAverageStrategy<H> {
    step_size_adapt: DualAverage,
    options: DualAverageSettings,
    num_tune: u64,
    num_early: u64,
    _phantom: PhantomData<H>,
}

impl<H> DualAverageStrategy<H> {
    fn target_accept(&self, draw: u64) -> f64 {
        if draw >= self.num_early {
            return self.options.target_accept;
        }
        let start = self.options.early_target_accept;
        let end = self.options.target_accept;
        let time = (draw as f64) / (self.num_early as f64);
        start + (end - start) * (1f64 + (6f64 * (time - 0.6)).tanh()) / 2f64
    }
}

/// Acceptance rate of one leapfrog step from `start`, or `None` if the step diverged.
fn leapfrog_accept<H: Hamiltonian>(
    hamiltonian: &mut H,
    pool: &mut crate::state::StatePool,
    start: &State,
    options: &NutsOptions,
) -> Option<f64> {
    let mut collector = AcceptanceRateCollector::new();
    collector.register_init(start, options);
    match hamiltonian.leapfrog(pool, start, Direction::Forward, &mut collector) {
        LeapfrogResult::Ok(_) => Some(collector.mean.current()),
        LeapfrogResult::Divergence(_) | LeapfrogResult::Err(_) => None,
    }
}

impl<H: Hamiltonian> AdaptStrategy for DualAverageStrategy<H> {
    type Hamiltonian = H;
    type Collector = AcceptanceRateCollector;
    type Options = DualAverageSettings;

    fn new(options: Self::Options, num_tune: u64, _dim: usize) -> Self {
        Self {
            num_tune,
            num_early: ((num_tune as f64) * options.final_window_ratio).ceil() as u64,
            options,
            step_size_adapt: DualAverage::new(options.params, options.initial_step),
            _phantom: PhantomData,
        }
    }

    /// Look for a step size whose single step acceptance rate crosses
    /// the target, by doubling or halving the initial step.
    fn init<R: Rng + ?Sized>(
        &mut self,
        options: &mut NutsOptions,
        hamiltonian: &mut H,
        state: &State,
        rng: &mut R,
    ) {
        let initial_step = self.options.initial_step;
        *hamiltonian.step_size_mut() = initial_step;

        let mut pool = hamiltonian.new_pool(2);
        let mut start = pool.new_state();
        let Ok(inner) = start.try_mut_inner() else {
            return;
        };
        inner.clone_from(&**state);
        hamiltonian.initialize_trajectory(&mut start, rng);

        let Some(accept_stat) = leapfrog_accept(hamiltonian, &mut pool, &start, options) else {
            return;
        };
        let grow = accept_stat > self.options.target_accept;

        for _ in 0..100 {
            let Some(accept_stat) = leapfrog_accept(hamiltonian, &mut pool, &start, options)
            else {
                *hamiltonian.step_size_mut() = initial_step;
                return;
            };
            let step_size = hamiltonian.step_size();
            let done = if grow {
                (accept_stat <= self.options.target_accept) | (step_size > 1e5)
            } else {
                (accept_stat >= self.options.target_accept) | (step_size < 1e-10)
            };
            if done {
                self.step_size_adapt = DualAverage::new(self.options.params, step_size);
                return;
            }
            if grow {
                *hamiltonian.step_size_mut() *= 2.;
            } else {
                *hamiltonian.step_size_mut() /= 2.;
            }
        }
        *hamiltonian.step_size_mut() = initial_step;
    }

    fn adapt(
        &mut self,
        _options: &mut NutsOptions,
        hamiltonian: &mut H,
        draw: u64,
        collector: &Self::Collector,
    ) {
        if draw < self.num_tune {
            let target = self.target_accept(draw);
            self.step_size_adapt
                .advance(collector.mean.current(), target);
        }
        // The next draw is the first one after warm-up once this holds.
        if draw + 1 >= self.num_tune {
            *hamiltonian.step_size_mut() = self.step_size_adapt.current_step_size_adapted();
        } else {
            *hamiltonian.step_size_mut() = self.step_size_adapt.current_step_size();
        }
    }

    fn new_collector(&self) -> Self::Collector {
        AcceptanceRateCollector::new()
    }
}

/// Diagonal mass matrix adaptation from exponentially weighted variances
/// of draws and gradients.
///
/// Two estimators run at the same time. The background estimator starts
/// fresh at every window switch and replaces the foreground one at the
/// next switch, so early transient draws are forgotten.
pub(crate) struct ExpWindowDiagAdapt<F> {
    dim: usize,
    num_tune: u64,
    exp_variance_draw: ExpWeightedVariance,
    exp_variance_grad: ExpWeightedVariance,
    exp_variance_draw_bg: ExpWeightedVariance,
    exp_variance_grad_bg: ExpWeightedVariance,
    settings: DiagAdaptExpSettings,
    _phantom: PhantomData<F>,
}

impl<F> ExpWindowDiagAdapt<F> {
    fn update_mass_matrix(&self, mass_matrix: &mut DiagMassMatrix) {
        mass_matrix.update_diag(
            izip!(
                self.exp_variance_draw.current(),
                self.exp_variance_grad.current(),
            )
            .map(|(draw, grad)| (draw / grad).sqrt().clamp(LOWER_LIMIT, UPPER_LIMIT)),
        );
    }
}

impl<F: CpuLogpFunc> AdaptStrategy for ExpWindowDiagAdapt<F> {
    type Hamiltonian = EuclideanHamiltonian<F, DiagMassMatrix>;
    type Collector = DrawGradCollector;
    type Options = DiagAdaptExpSettings;

    fn new(options: Self::Options, num_tune: u64, dim: usize) -> Self {
        Self {
            dim,
            num_tune: num_tune.saturating_sub(options.final_window),
            exp_variance_draw: ExpWeightedVariance::new(dim, options.early_variance_decay),
            exp_variance_grad: ExpWeightedVariance::new(dim, options.early_variance_decay),
            exp_variance_draw_bg: ExpWeightedVariance::new(dim, options.early_variance_decay),
            exp_variance_grad_bg: ExpWeightedVariance::new(dim, options.early_variance_decay),
            settings: options,
            _phantom: PhantomData,
        }
    }

    fn init<R: Rng + ?Sized>(
        &mut self,
        _options: &mut NutsOptions,
        hamiltonian: &mut Self::Hamiltonian,
        state: &State,
        _rng: &mut R,
    ) {
        self.exp_variance_draw.set_variance(iter::repeat(1f64));
        self.exp_variance_draw.set_mean(state.q.iter().copied());
        let grad_init = self.settings.grad_init;
        self.exp_variance_grad
            .set_variance(state.grad.iter().map(|&val| {
                let diag = val * val;
                if !grad_init || diag == 0f64 || !diag.is_finite() {
                    1f64
                } else {
                    diag
                }
            }));
        self.exp_variance_grad.set_mean(iter::repeat(0f64));

        self.update_mass_matrix(&mut hamiltonian.mass_matrix);
    }

    fn adapt(
        &mut self,
        _options: &mut NutsOptions,
        hamiltonian: &mut Self::Hamiltonian,
        draw: u64,
        collector: &Self::Collector,
    ) {
        if draw >= self.num_tune {
            return;
        }

        let count = self.exp_variance_draw_bg.count();

        let early_switch = (count == self.settings.early_window_switch_freq)
            & (draw < self.settings.window_switch_freq);

        if early_switch | ((draw % self.settings.window_switch_freq == 0) & (count > 5)) {
            self.exp_variance_draw = std::mem::replace(
                &mut self.exp_variance_draw_bg,
                ExpWeightedVariance::new(self.dim, self.settings.variance_decay),
            );
            self.exp_variance_grad = std::mem::replace(
                &mut self.exp_variance_grad_bg,
                ExpWeightedVariance::new(self.dim, self.settings.variance_decay),
            );

            self.exp_variance_draw_bg
                .set_mean(collector.draw.iter().copied());
            self.exp_variance_grad_bg
                .set_mean(collector.grad.iter().copied());
        } else if collector.is_good {
            self.exp_variance_draw
                .add_sample(collector.draw.iter().copied());
            self.exp_variance_grad
                .add_sample(collector.grad.iter().copied());
            self.exp_variance_draw_bg
                .add_sample(collector.draw.iter().copied());
            self.exp_variance_grad_bg
                .add_sample(collector.grad.iter().copied());
        }

        if (self.exp_variance_draw.count() > 2)
            & (self.settings.grad_init | (draw > self.settings.window_switch_freq))
        {
            self.update_mass_matrix(&mut hamiltonian.mass_matrix);
        }
    }

    fn new_collector(&self) -> Self::Collector {
        DrawGradCollector::new(self.dim)
    }
}

pub(crate) struct CombinedStrategy<S1, S2> {
    data1: S1,
    data2: S2,
}

#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct CombinedOptions<O1, O2> {
    pub(crate) options1: O1,
    pub(crate) options2: O2,
}

impl<S1, S2> AdaptStrategy for CombinedStrategy<S1, S2>
where
    S1: AdaptStrategy,
    S2: AdaptStrategy<Hamiltonian = S1::Hamiltonian>,
{
    type Hamiltonian = S1::Hamiltonian;
    type Collector = CombinedCollector<S1::Collector, S2::Collector>;
    type Options = CombinedOptions<S1::Options, S2::Options>;

    fn new(options: Self::Options, num_tune: u64, dim: usize) -> Self {
        Self {
            data1: S1::new(options.options1, num_tune, dim),
            data2: S2::new(options.options2, num_tune, dim),
        }
    }

    fn init<R: Rng + ?Sized>(
        &mut self,
        options: &mut NutsOptions,
        hamiltonian: &mut Self::Hamiltonian,
        state: &State,
        rng: &mut R,
    ) {
        // The mass matrix has to be in place before the step size search.
        self.data2.init(options, hamiltonian, state, rng);
        self.data1.init(options, hamiltonian, state, rng);
    }

    fn adapt(
        &mut self,
        options: &mut NutsOptions,
        hamiltonian: &mut Self::Hamiltonian,
        draw: u64,
        collector: &Self::Collector,
    ) {
        self.data1
            .adapt(options, hamiltonian, draw, &collector.collector1);
        self.data2
            .adapt(options, hamiltonian, draw, &collector.collector2);
    }

    fn new_collector(&self) -> Self::Collector {
        CombinedCollector {
            collector1: self.data1.new_collector(),
            collector2: self.data2.new_collector(),
        }
    }
}

pub(crate) struct CombinedCollector<C1: Collector, C2: Collector> {
    pub(crate) collector1: C1,
    pub(crate) collector2: C2,
}

impl<C1: Collector, C2: Collector> Collector for CombinedCollector<C1, C2> {
    fn register_leapfrog(
        &mut self,
        start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        self.collector1
            .register_leapfrog(start, end, divergence_info);
        self.collector2
            .register_leapfrog(start, end, divergence_info);
    }

    fn register_draw(&mut self, state: &State, info: &SampleInfo) {
        self.collector1.register_draw(state, info);
        self.collector2.register_draw(state, info);
    }

    fn register_init(&mut self, state: &State, options: &NutsOptions) {
        self.collector1.register_init(state, options);
        self.collector2.register_init(state, options);
    }
}

/// The warm-up used by the sampler: dual averaging for the step size
/// and exponentially windowed diagonal mass matrix adaptation.
pub(crate) type DefaultStrategy<F> = CombinedStrategy<
    DualAverageStrategy<EuclideanHamiltonian<F, DiagMassMatrix>>,
    ExpWindowDiagAdapt<F>,
>;
