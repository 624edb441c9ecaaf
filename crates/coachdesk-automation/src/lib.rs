//! # CoachDesk Automation
//!
//! Turns automation rules into outbound messages, at most once per occasion.
//!
//! ## Architecture
//! ```text
//! Sweeper (tokio interval) / manual send / bulk send
//!   └── Dispatcher
//!         ├── Evaluator: rule + now → candidates (recipient, occasion)
//!         │     └── RecipientDirectory (sessions, charges, birthdays, activity)
//!         ├── Gate: consent → send window (recipient tz) → ledger reserve
//!         │     └── DispatchLedger: atomic cap + uniqueness per dispatch key
//!         ├── TemplateRenderer → RenderedMessage
//!         ├── ChannelAdapter (log, webhook, telegram)
//!         └── ledger finalize: reserved → sent | failed
//! ```
//!
//! ## Guarantees
//! - One `reserved`/`sent` record per (rule, recipient, occasion, local day).
//! - A recipient never gets more than `max_per_day` messages from one rule
//!   on one local day, across sweeps, manual sends and processes.
//! - Reservations are never rolled back; a crash between reserve and send
//!   leaves a stale reservation instead of a duplicate message.

pub mod channel;
pub mod directory;
pub mod evaluator;
pub mod gate;
pub mod ledger;
pub mod orchestrator;
pub mod recipient;
pub mod rules;
pub mod runner;
pub mod template;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{build_channel, ChannelAdapter, ChannelError, ChannelErrorKind, RenderedMessage};
pub use directory::{DirectorySnapshot, RecipientDirectory, RuleDirectory, SqliteDirectory};
pub use evaluator::{Candidate, Evaluator};
pub use gate::{Gate, GateMode, GateRejection};
pub use ledger::{DispatchKey, DispatchLedger, DispatchRecord, DispatchStatus, SqliteLedger};
pub use orchestrator::{
    DispatchBatch, DispatchOutcome, DispatchSettings, DispatchSource, Dispatcher, RecipientResult, SweepReport,
};
pub use recipient::{Charge, Occasion, Recipient, RecipientStatus, Session};
pub use rules::{AutomationRule, SendWindow, Trigger};
pub use runner::spawn_sweeper;
pub use template::{TemplateBook, TemplateRenderer};
