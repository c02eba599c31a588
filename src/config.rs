//! Run configuration: what data to simulate, the prior, and how to sample.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    diagnostics::ConvergencePolicy,
    model::{BetaPrior, ModelError},
    sampler::NutsSettings,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("n_flips must be positive")]
    NoFlips,
    #[error("p_true must lie strictly between 0 and 1, got {0}")]
    InvalidProbability(f64),
    #[error("at least one chain is required")]
    NoChains,
    #[error("tune must be positive, the sampler needs warm-up draws")]
    NoTune,
    #[error("at least one draw per chain is required")]
    NoDraws,
    #[error("maxdepth must be positive")]
    NoDepth,
    #[error("rhat_threshold must be finite and >= 1, got {0}")]
    InvalidThreshold(f64),
    #[error(transparent)]
    Prior(#[from] ModelError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of simulated coinflips.
    pub n_flips: usize,
    /// Probability of heads used to simulate the data.
    pub p_true: f64,
    pub prior: BetaPrior,
    pub chains: usize,
    /// Warm-up draws per chain.
    pub tune: u64,
    /// Draws per chain after warm-up.
    pub draws: u64,
    pub maxdepth: u64,
    /// Seeds both the simulator and the sampler.
    pub seed: u64,
    pub rhat_threshold: f64,
    pub policy: ConvergencePolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n_flips: 100,
            p_true: 0.7,
            prior: BetaPrior::default(),
            chains: 4,
            tune: 1000,
            draws: 1000,
            maxdepth: 10,
            seed: 42,
            rhat_threshold: 1.01,
            policy: ConvergencePolicy::Warn,
        }
    }
}

impl RunConfig {
    /// Load a config from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_flips == 0 {
            return Err(ConfigError::NoFlips);
        }
        if !(self.p_true > 0.0 && self.p_true < 1.0) {
            return Err(ConfigError::InvalidProbability(self.p_true));
        }
        if self.chains == 0 {
            return Err(ConfigError::NoChains);
        }
        if self.tune == 0 {
            return Err(ConfigError::NoTune);
        }
        if self.draws == 0 {
            return Err(ConfigError::NoDraws);
        }
        if self.maxdepth == 0 {
            return Err(ConfigError::NoDepth);
        }
        if !(self.rhat_threshold.is_finite() && self.rhat_threshold >= 1.0) {
            return Err(ConfigError::InvalidThreshold(self.rhat_threshold));
        }
        self.prior.validate()?;
        Ok(())
    }

    pub fn to_nuts_settings(&self) -> NutsSettings {
        NutsSettings {
            num_tune: self.tune,
            num_draws: self.draws,
            maxdepth: self.maxdepth,
            num_chains: self.chains,
            seed: self.seed,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = RunConfig::default();
        assert_eq!(config.n_flips, 100);
        assert_eq!(config.p_true, 0.7);
        assert_eq!(config.chains, 4);
        assert_eq!(config.seed, 42);
        assert_eq!(config.policy, ConvergencePolicy::Warn);
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"n_flips": 250, "prior": {{"alpha": 1.0, "beta": 3.0}}, "policy": "fail"}}"#
        )
        .unwrap();
        let config = RunConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.n_flips, 250);
        assert_eq!(config.prior, BetaPrior { alpha: 1.0, beta: 3.0 });
        assert_eq!(config.policy, ConvergencePolicy::Fail);
        assert_eq!(config.draws, 1000);
    }

    #[test]
    fn missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            RunConfig::from_json_file(&missing),
            Err(ConfigError::Io { .. })
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ n_flips: ").unwrap();
        assert!(matches!(
            RunConfig::from_json_file(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn validation() {
        let base = RunConfig::default();
        let check = |config: RunConfig| config.validate().unwrap_err().to_string();

        assert!(matches!(
            RunConfig { n_flips: 0, ..base }.validate(),
            Err(ConfigError::NoFlips)
        ));
        assert!(check(RunConfig { p_true: 1.0, ..base }).contains("p_true"));
        assert!(matches!(
            RunConfig { chains: 0, ..base }.validate(),
            Err(ConfigError::NoChains)
        ));
        assert!(matches!(
            RunConfig { tune: 0, ..base }.validate(),
            Err(ConfigError::NoTune)
        ));
        assert!(matches!(
            RunConfig { draws: 0, ..base }.validate(),
            Err(ConfigError::NoDraws)
        ));
        assert!(matches!(
            RunConfig {
                prior: BetaPrior { alpha: -1.0, beta: 2.0 },
                ..base
            }
            .validate(),
            Err(ConfigError::Prior(_))
        ));
        assert!(check(RunConfig { rhat_threshold: 0.9, ..base }).contains("rhat_threshold"));
    }

    #[test]
    fn converts_to_sampler_settings() {
        let config = RunConfig {
            chains: 2,
            tune: 300,
            draws: 400,
            maxdepth: 6,
            seed: 9,
            ..Default::default()
        };
        let settings = config.to_nuts_settings();
        assert_eq!(settings.num_chains, 2);
        assert_eq!(settings.num_tune, 300);
        assert_eq!(settings.num_draws, 400);
        assert_eq!(settings.maxdepth, 6);
        assert_eq!(settings.seed, 9);
    }
}
