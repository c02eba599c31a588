//! Bayesian inference of the probability of heads of a coin.
//!
//! Simulated coinflips are combined with a Beta prior, the posterior is
//! reparameterized to the real line with a logit transform and sampled with
//! the No-U-Turn sampler in several parallel chains. The draws are checked
//! with R-hat and effective sample size and summarized by their mean and
//! standard deviation.
//!
//! ```no_run
//! use coinflip_nuts::{run, RunConfig};
//!
//! let report = run(&RunConfig::default()).unwrap();
//! println!("{}", report.summary);
//! ```

pub(crate) mod adapt_strategy;
pub(crate) mod chain;
pub mod config;
pub mod data;
pub mod diagnostics;
pub(crate) mod euclidean_hamiltonian;
pub(crate) mod hamiltonian;
pub(crate) mod mass_matrix;
pub(crate) mod math;
pub mod model;
pub(crate) mod nuts;
pub mod pipeline;
pub(crate) mod sampler;
pub(crate) mod state;
pub(crate) mod stepsize;
pub mod summary;
pub mod transform;

pub use adapt_strategy::DualAverageSettings;
pub use chain::{Chain, DrawStats};
pub use config::{ConfigError, RunConfig};
pub use data::simulate_flips;
pub use diagnostics::{
    ebfmi, ess_bulk, ess_tail, r_hat, r_hat_rank_normalized, ConvergencePolicy, Diagnostics,
};
pub use euclidean_hamiltonian::CpuLogpFunc;
pub use hamiltonian::{DivergenceInfo, LogpError};
pub use mass_matrix::DiagAdaptExpSettings;
pub use model::{BetaPrior, CoinflipProblem, ModelError, Params};
pub use nuts::NutsError;
pub use pipeline::{run, PipelineError, PipelineReport};
pub use sampler::{sample_chain, sample_parallel, ChainOutput, NutsSettings, MAX_INIT_TRIES};
pub use stepsize::DualAverageOptions;
pub use summary::{pool_constrained, PosteriorSummary, SummaryError};
pub use transform::{LogitTransform, TransformError, TransformedPosterior};
