//! OneMind balance tracker core
//!
//! Client-side cache and proxy for the balance service that records API
//! spend per provider and engine. Shared by the CLI and any embedding app.

pub mod balance;
pub mod config;
pub mod error;

pub use balance::{
    BalanceBackend, BalanceFailure, BalanceOperation, BalanceRecord, BalanceStatus,
    BalanceSummary, BalanceTracker, HttpBalanceBackend,
};
pub use config::TrackerConfig;
pub use error::{BalanceError, BalanceResult};
