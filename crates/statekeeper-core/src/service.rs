//! Reconciliation service that coordinates config, providers and approvals.

use crate::apply::{ApplyEngine, ApplyReport};
use crate::approval::{Approval, ApprovalStore};
use crate::config::StatekeeperConfig;
use crate::diff::compute_diff;
use crate::drift::PlanSource;
use crate::error::{StatekeeperError, StatekeeperResult};
use crate::live::{LiveState, LiveStateReader};
use crate::plan::{Plan, ResourceKind};
use crate::provider::{ShareProvider, ZfsProvider};
use crate::state::{default_template, DesiredState};
use crate::statefile::write_atomic;
use log::{error, info};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Current desired-state document as served to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateDocument {
    pub path: PathBuf,
    pub content: String,
    /// False when `content` is the starter template.
    pub exists: bool,
}

/// Outcome of validating (and optionally writing) a new state document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PutStateOutcome {
    pub valid: bool,
    pub written: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Owns the providers and approvals; one instance per process, shared by handle.
///
/// Plans are never cached: every call re-reads the desired state and the
/// live system, so two close calls may legitimately see different plans.
pub struct ReconcileService<Z: ZfsProvider, S: ShareProvider> {
    config: Arc<StatekeeperConfig>,
    zfs: Z,
    shares: S,
    approvals: ApprovalStore,
    apply_lock: Mutex<()>,
}

impl<Z: ZfsProvider, S: ShareProvider> ReconcileService<Z, S> {
    pub fn new(config: Arc<StatekeeperConfig>, zfs: Z, shares: S, approvals: ApprovalStore) -> Self {
        Self {
            config,
            zfs,
            shares,
            approvals,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &StatekeeperConfig {
        &self.config
    }

    pub fn state_path(&self) -> &Path {
        &self.config.state.path
    }

    pub fn zfs(&self) -> &Z {
        &self.zfs
    }

    pub fn shares(&self) -> &S {
        &self.shares
    }

    pub fn load_desired(&self) -> StatekeeperResult<DesiredState> {
        DesiredState::load(self.state_path())
    }

    pub fn read_live(&self) -> StatekeeperResult<LiveState> {
        LiveStateReader::new(&self.zfs, &self.shares).read()
    }

    fn fresh_plan(&self) -> StatekeeperResult<Plan> {
        let desired = self.load_desired()?;
        let live = self.read_live()?;
        Ok(compute_diff(&desired, &live))
    }

    /// Fresh plan with prior approvals stamped in.
    pub fn plan(&self) -> StatekeeperResult<Plan> {
        let mut plan = self.fresh_plan()?;
        self.approvals.stamp(&mut plan);
        let s = &plan.summary;
        info!(
            "plan computed: {} create, {} modify, {} delete, {} blocked, {} nop",
            s.create_count, s.modify_count, s.delete_count, s.blocked_count, s.nop_count
        );
        Ok(plan)
    }

    /// Approve one Blocked item, checked against a plan computed right now.
    /// Waits for a running apply so its closing `clear_all` cannot drop this
    /// approval.
    pub fn approve(&self, kind: ResourceKind, name: &str, reason: &str) -> StatekeeperResult<String> {
        let _serial = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.approvals
            .approve(kind, name, reason, || self.fresh_plan())
    }

    /// Recompute, gate and execute. Only one apply runs at a time; a second
    /// caller waits and then works from a plan computed after the first ends.
    pub fn apply(&self) -> StatekeeperResult<ApplyReport> {
        let _serial = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let plan = self.plan()?;
        let report = ApplyEngine::new(&self.zfs, &self.shares).execute(&plan);
        if report.success() {
            if let Err(err) = self.approvals.clear_all() {
                error!("apply succeeded but approvals could not be cleared: {err}");
            }
        }
        Ok(report)
    }

    pub fn approvals(&self) -> Vec<Approval> {
        self.approvals.list()
    }

    /// The state file as written, or the starter template when none exists.
    pub fn get_state(&self) -> StatekeeperResult<StateDocument> {
        let path = self.state_path().to_path_buf();
        match fs::read_to_string(&path) {
            Ok(content) => Ok(StateDocument {
                path,
                content,
                exists: true,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(StateDocument {
                path,
                content: default_template().to_string(),
                exists: false,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Validate `content`; unless `dry_run`, replace the state file atomically.
    /// An invalid document is reported in the outcome, never written.
    pub fn put_state(&self, content: &str, dry_run: bool) -> StatekeeperResult<PutStateOutcome> {
        let state = match DesiredState::parse(content) {
            Ok(state) => state,
            Err(err) if err.is_state_error() => {
                let field = match &err {
                    StatekeeperError::Validation { field, .. } => Some(field.clone()),
                    _ => None,
                };
                return Ok(PutStateOutcome {
                    valid: false,
                    written: false,
                    summary: None,
                    error: Some(err.to_string()),
                    field,
                });
            }
            Err(err) => return Err(err),
        };

        if !dry_run {
            write_atomic(self.state_path(), content.as_bytes())?;
            info!(
                "desired state written to {} ({})",
                self.state_path().display(),
                state.summary()
            );
        }

        Ok(PutStateOutcome {
            valid: true,
            written: !dry_run,
            summary: Some(state.summary()),
            error: None,
            field: None,
        })
    }
}

impl<Z: ZfsProvider, S: ShareProvider> PlanSource for ReconcileService<Z, S> {
    fn current_plan(&self) -> StatekeeperResult<Plan> {
        self.plan()
    }

    fn state_path(&self) -> PathBuf {
        self.config.state.path.clone()
    }
}
