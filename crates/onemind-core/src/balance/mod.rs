mod backend;
mod clock;
mod http;
mod model;
mod spawn;
mod tracker;

pub use backend::{
    ApiEnvelope, BalanceBackend, DeductRequest, ImportRequest, ResetRequest, UpdateBalanceRequest,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use http::HttpBalanceBackend;
pub use model::{default_balances, BalanceRecord, BalanceStatus, BalanceSummary};
pub use spawn::{ManualSpawner, Spawner, TokioSpawner};
pub use tracker::{
    BalanceFailure, BalanceOperation, BalanceTracker, BalanceTrackerBuilder, FailureHook,
};
