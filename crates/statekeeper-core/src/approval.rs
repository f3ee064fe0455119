//! Operator approvals for Blocked plan items.
//!
//! The in-memory map answers stamping; a repository mirrors it durably so
//! approvals survive a restart. The map lock is never held across I/O.

use crate::error::{StatekeeperError, StatekeeperResult};
use crate::plan::{item_key, Plan, PlanAction, ResourceKind};
use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub kind: ResourceKind,
    pub name: String,
    pub reason: String,
    pub approved_at: DateTime<Utc>,
}

impl Approval {
    pub fn key(&self) -> String {
        item_key(self.kind, &self.name)
    }
}

/// Durable backing for approvals, upserted by `(kind, name)`.
pub trait ApprovalRepository: Send + Sync {
    fn load_all(&self) -> StatekeeperResult<Vec<Approval>>;
    fn upsert(&self, approval: &Approval) -> StatekeeperResult<()>;
    fn clear(&self) -> StatekeeperResult<()>;
}

/// SQLite table `approvals` in the daemon database.
pub struct SqliteApprovalRepository {
    conn: Mutex<Connection>,
}

impl SqliteApprovalRepository {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> StatekeeperResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StatekeeperResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StatekeeperResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS approvals (
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                approved_at TEXT NOT NULL,
                PRIMARY KEY (kind, name)
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ApprovalRepository for SqliteApprovalRepository {
    fn load_all(&self) -> StatekeeperResult<Vec<Approval>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt =
            conn.prepare("SELECT kind, name, reason, approved_at FROM approvals ORDER BY kind, name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, DateTime<Utc>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(kind, name, reason, approved_at)| {
                Ok(Approval {
                    kind: kind.parse()?,
                    name,
                    reason,
                    approved_at,
                })
            })
            .collect()
    }

    fn upsert(&self, approval: &Approval) -> StatekeeperResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO approvals (kind, name, reason, approved_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, name) DO UPDATE SET
                reason = excluded.reason,
                approved_at = excluded.approved_at",
            params![
                approval.kind.as_str(),
                approval.name,
                approval.reason,
                approval.approved_at
            ],
        )?;
        Ok(())
    }

    fn clear(&self) -> StatekeeperResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM approvals", [])?;
        Ok(())
    }
}

/// Volatile repository for tests and dry runs.
#[derive(Default)]
pub struct MemoryApprovalRepository {
    rows: Mutex<Vec<Approval>>,
}

impl ApprovalRepository for MemoryApprovalRepository {
    fn load_all(&self) -> StatekeeperResult<Vec<Approval>> {
        Ok(self.rows.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn upsert(&self, approval: &Approval) -> StatekeeperResult<()> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.retain(|row| row.key() != approval.key());
        rows.push(approval.clone());
        Ok(())
    }

    fn clear(&self) -> StatekeeperResult<()> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}

pub struct ApprovalStore {
    approvals: Mutex<HashMap<String, Approval>>,
    repository: Box<dyn ApprovalRepository>,
}

impl ApprovalStore {
    /// Build the store and load every persisted approval.
    pub fn open(repository: Box<dyn ApprovalRepository>) -> StatekeeperResult<Self> {
        let approvals = repository
            .load_all()?
            .into_iter()
            .map(|approval| (approval.key(), approval))
            .collect::<HashMap<_, _>>();
        if !approvals.is_empty() {
            info!("loaded {} pending approval(s)", approvals.len());
        }
        Ok(Self {
            approvals: Mutex::new(approvals),
            repository,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            approvals: Mutex::new(HashMap::new()),
            repository: Box::new(MemoryApprovalRepository::default()),
        }
    }

    /// Mark every approved Blocked item in `plan` and refresh its verdict.
    pub fn stamp(&self, plan: &mut Plan) {
        {
            let approvals = self.approvals.lock().unwrap_or_else(PoisonError::into_inner);
            for item in plan
                .items
                .iter_mut()
                .filter(|item| item.action == PlanAction::Blocked)
            {
                item.approved = approvals.contains_key(&item.key());
            }
        }
        plan.recount();
    }

    /// Record an approval for `kind/name`.
    ///
    /// `fresh_plan` must recompute the plan from scratch; the approval is only
    /// recorded when the item is Blocked in that plan. Returns the block reason.
    pub fn approve<F>(
        &self,
        kind: ResourceKind,
        name: &str,
        reason: &str,
        fresh_plan: F,
    ) -> StatekeeperResult<String>
    where
        F: FnOnce() -> StatekeeperResult<Plan>,
    {
        let plan = fresh_plan()?;
        let key = item_key(kind, name);
        let item = plan
            .find(kind, name)
            .filter(|item| item.action == PlanAction::Blocked)
            .ok_or_else(|| StatekeeperError::NotBlocked { key: key.clone() })?;
        let block_reason = item.block_reason.clone().unwrap_or_default();

        let approval = Approval {
            kind,
            name: name.to_string(),
            reason: reason.to_string(),
            approved_at: Utc::now(),
        };
        self.repository.upsert(&approval)?;
        self.approvals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), approval);

        info!("approval recorded for {key}: {reason}");
        Ok(block_reason)
    }

    /// Drop every approval; called once after a fully successful apply.
    pub fn clear_all(&self) -> StatekeeperResult<()> {
        let cleared = {
            let mut approvals = self.approvals.lock().unwrap_or_else(PoisonError::into_inner);
            let count = approvals.len();
            approvals.clear();
            count
        };
        self.repository.clear()?;
        if cleared > 0 {
            info!("cleared {cleared} consumed approval(s)");
        }
        Ok(())
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        self.approvals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&item_key(kind, name))
    }

    pub fn list(&self) -> Vec<Approval> {
        let mut approvals: Vec<Approval> = self
            .approvals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        approvals.sort_by_key(Approval::key);
        approvals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanItem, RiskLevel};
    use tempfile::tempdir;

    fn plan_with(action: PlanAction) -> Plan {
        let mut item = PlanItem::new(ResourceKind::Dataset, "tank/old", action, RiskLevel::Critical);
        if action == PlanAction::Blocked {
            item.block_reason = Some("has data".into());
            item.withheld = Some(PlanAction::Delete);
        }
        Plan::from_items(vec![item])
    }

    #[test]
    fn approving_a_blocked_item_stamps_future_plans() {
        let store = ApprovalStore::in_memory();
        let reason = store
            .approve(ResourceKind::Dataset, "tank/old", "verified empty", || {
                Ok(plan_with(PlanAction::Blocked))
            })
            .unwrap();
        assert_eq!(reason, "has data");
        assert!(store.contains(ResourceKind::Dataset, "tank/old"));

        let mut plan = plan_with(PlanAction::Blocked);
        assert!(!plan.summary.safe_to_apply);
        store.stamp(&mut plan);
        assert!(plan.items[0].approved);
        assert!(plan.summary.safe_to_apply);
    }

    #[test]
    fn approving_a_non_blocked_item_records_nothing() {
        let store = ApprovalStore::in_memory();
        let err = store
            .approve(ResourceKind::Dataset, "tank/old", "sure", || {
                Ok(plan_with(PlanAction::Delete))
            })
            .unwrap_err();
        assert!(matches!(err, StatekeeperError::NotBlocked { .. }));
        assert!(store.list().is_empty());

        let err = store
            .approve(ResourceKind::Share, "tank/old", "wrong kind", || {
                Ok(plan_with(PlanAction::Blocked))
            })
            .unwrap_err();
        assert_eq!(err.code(), "SK3000");
        assert!(store.list().is_empty());
    }

    #[test]
    fn plan_failure_propagates_without_recording() {
        let store = ApprovalStore::in_memory();
        let err = store
            .approve(ResourceKind::Dataset, "tank/old", "x", || {
                Err(StatekeeperError::Provider("zfs unavailable".into()))
            })
            .unwrap_err();
        assert!(matches!(err, StatekeeperError::Provider(_)));
        assert!(store.list().is_empty());
    }

    #[test]
    fn stamping_ignores_items_that_are_no_longer_blocked() {
        let store = ApprovalStore::in_memory();
        store
            .approve(ResourceKind::Dataset, "tank/old", "ok", || {
                Ok(plan_with(PlanAction::Blocked))
            })
            .unwrap();
        let mut plan = plan_with(PlanAction::Delete);
        store.stamp(&mut plan);
        assert!(!plan.items[0].approved);
    }

    #[test]
    fn clear_all_empties_memory_and_repository() {
        let store = ApprovalStore::in_memory();
        store
            .approve(ResourceKind::Dataset, "tank/old", "ok", || {
                Ok(plan_with(PlanAction::Blocked))
            })
            .unwrap();
        store.clear_all().unwrap();
        assert!(!store.contains(ResourceKind::Dataset, "tank/old"));
        assert!(store.repository.load_all().unwrap().is_empty());
    }

    #[test]
    fn sqlite_approvals_survive_reopen() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("state").join("statekeeper.db");

        {
            let repo = SqliteApprovalRepository::open(&db).unwrap();
            let store = ApprovalStore::open(Box::new(repo)).unwrap();
            store
                .approve(ResourceKind::Dataset, "tank/old", "first", || {
                    Ok(plan_with(PlanAction::Blocked))
                })
                .unwrap();
            store
                .approve(ResourceKind::Dataset, "tank/old", "second", || {
                    Ok(plan_with(PlanAction::Blocked))
                })
                .unwrap();
        }

        let repo = SqliteApprovalRepository::open(&db).unwrap();
        let store = ApprovalStore::open(Box::new(repo)).unwrap();
        let approvals = store.list();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].key(), "dataset/tank/old");
        assert_eq!(approvals[0].reason, "second");

        store.clear_all().unwrap();
        let repo = SqliteApprovalRepository::open(&db).unwrap();
        assert!(repo.load_all().unwrap().is_empty());
    }
}
