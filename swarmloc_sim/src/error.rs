// swarmloc_sim/src/error.rs

use swarmloc_core::error::LocalizationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("failed to load scenario: {0}")]
    Config(#[from] figment::Error),

    #[error("invalid scenario: {0}")]
    Scenario(String),

    #[error("invalid noise parameter: {0}")]
    Distribution(#[from] rand_distr::NormalError),

    #[error(transparent)]
    Localization(#[from] LocalizationError),

    #[error("failed to encode run report: {0}")]
    Report(#[from] toml::ser::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
