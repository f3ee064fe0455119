pub mod apply;
pub mod approval;
pub mod config;
pub mod diff;
pub mod drift;
pub mod error;
pub mod live;
pub mod logging;
pub mod plan;
pub mod provider;
pub mod service;
pub mod state;
pub mod statefile;
pub mod units;

pub use apply::{ApplyEngine, ApplyReport};
pub use approval::{Approval, ApprovalStore, SqliteApprovalRepository};
pub use config::StatekeeperConfig;
pub use diff::compute_diff;
pub use drift::{DriftBroadcaster, DriftDetector, DriftLevel, DriftResult, PlanSource};
pub use error::{StatekeeperError, StatekeeperResult};
pub use live::{LiveState, LiveStateReader};
pub use plan::{Plan, PlanAction, PlanItem, ResourceKind, RiskLevel};
pub use provider::{ShareProvider, ZfsProvider};
pub use service::{PutStateOutcome, ReconcileService, StateDocument};
pub use state::DesiredState;
