//! Error taxonomy for CoachDesk.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoachDeskError>;

#[derive(Debug, Error)]
pub enum CoachDeskError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
