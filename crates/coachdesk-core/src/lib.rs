//! # CoachDesk Core
//!
//! Configuration and error types shared by the CoachDesk crates.

pub mod config;
pub mod error;

pub use config::CoachDeskConfig;
pub use error::{CoachDeskError, Result};
