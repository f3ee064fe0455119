//! Apply engine: executes a stamped plan against the providers.
//!
//! The approval gate is all-or-nothing. Execution runs in plan order and stops
//! at the first failure; nothing already applied is rolled back.

use crate::error::{StatekeeperError, StatekeeperResult};
use crate::plan::{DesiredSpec, Plan, PlanAction, PlanItem, ResourceKind};
use crate::provider::{ShareProvider, ZfsProvider};
use crate::units::humanise_bytes;
use log::{error, info, warn};
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedStep {
    pub key: String,
    pub action: PlanAction,
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedStep {
    pub key: String,
    pub action: PlanAction,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: Vec<AppliedStep>,
    pub failed: Vec<FailedStep>,
    /// Blocked items that stopped the run before anything was touched.
    pub unapproved: Vec<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

impl ApplyReport {
    pub fn success(&self) -> bool {
        self.unapproved.is_empty() && self.failed.is_empty()
    }
}

pub struct ApplyEngine<'a, Z: ZfsProvider, S: ShareProvider> {
    zfs: &'a Z,
    shares: &'a S,
}

impl<'a, Z: ZfsProvider, S: ShareProvider> ApplyEngine<'a, Z, S> {
    pub fn new(zfs: &'a Z, shares: &'a S) -> Self {
        Self { zfs, shares }
    }

    /// Execute `plan`. Never returns an error: failures are reported per step.
    pub fn execute(&self, plan: &Plan) -> ApplyReport {
        let started = Instant::now();
        let mut report = ApplyReport::default();

        let unapproved = plan.unapproved_blocked();
        if !unapproved.is_empty() {
            warn!(
                "apply refused: {} blocked item(s) need approval: {}",
                unapproved.len(),
                unapproved.join(", ")
            );
            report.unapproved = unapproved;
            report.duration = started.elapsed();
            return report;
        }

        let steps: Vec<&PlanItem> = plan
            .items
            .iter()
            .filter(|item| item.action != PlanAction::Nop)
            .collect();
        for (idx, item) in steps.iter().enumerate() {
            let action = effective_action(item);
            if let Err(err) = self.execute_item(item, action) {
                error!("apply halted at {}: {}", item.key(), err);
                report.failed.push(FailedStep {
                    key: item.key(),
                    action,
                    reason: err.to_string(),
                });
                let halted_at = item.key();
                report.failed.extend(steps[idx + 1..].iter().map(|rest| FailedStep {
                    key: rest.key(),
                    action: effective_action(rest),
                    reason: format!("not attempted: apply halted at {halted_at}"),
                }));
                break;
            }
            info!("applied {} {}", action_label(item, action), item.key());
            report.applied.push(AppliedStep {
                key: item.key(),
                action,
                approved: item.approved,
            });
        }

        report.duration = started.elapsed();
        info!(
            "apply finished: {} applied, {} failed in {:?}",
            report.applied.len(),
            report.failed.len(),
            report.duration
        );
        report
    }

    fn execute_item(&self, item: &PlanItem, action: PlanAction) -> StatekeeperResult<()> {
        match (item.kind, action) {
            (ResourceKind::Pool, PlanAction::Create) => match &item.desired {
                Some(DesiredSpec::Pool(pool)) => self.zfs.create_pool(pool),
                _ => Err(missing_spec(item)),
            },
            (ResourceKind::Pool, PlanAction::Modify) => self.modify_pool(item),
            (ResourceKind::Pool, PlanAction::Delete) => self.destroy_pool(item),

            (ResourceKind::Dataset, PlanAction::Create) => match &item.desired {
                Some(DesiredSpec::Dataset(dataset)) => self.zfs.create_dataset(dataset),
                _ => Err(missing_spec(item)),
            },
            (ResourceKind::Dataset, PlanAction::Modify) => {
                for change in &item.changes {
                    if change.field == "encryption" {
                        warn!("{}: encryption is creation-time only; leaving it unchanged", item.key());
                        continue;
                    }
                    self.zfs
                        .set_dataset_property(&item.name, &change.field, &change.desired)?;
                }
                Ok(())
            }
            (ResourceKind::Dataset, PlanAction::Delete) => self.delete_dataset(item),

            (ResourceKind::Share, PlanAction::Create | PlanAction::Modify) => match &item.desired {
                Some(DesiredSpec::Share(share)) => {
                    self.shares.upsert_share(share)?;
                    self.shares.reload()
                }
                _ => Err(missing_spec(item)),
            },
            (ResourceKind::Share, PlanAction::Delete) => self.delete_share(item),

            (_, PlanAction::Blocked | PlanAction::Nop) => Ok(()),
        }
    }

    fn modify_pool(&self, item: &PlanItem) -> StatekeeperResult<()> {
        for change in &item.changes {
            match change.field.as_str() {
                "disk-add" => self.zfs.add_pool_disk(&item.name, &change.desired)?,
                "disk-remove" if item.approved => {
                    self.zfs.remove_pool_disk(&item.name, &change.live)?
                }
                "disk-remove" => {
                    return Err(StatekeeperError::Provider(format!(
                        "refusing to remove disk {} from pool {} without approval",
                        change.live, item.name
                    )))
                }
                other => warn!("pool {}: ignoring unsupported change {other}", item.name),
            }
        }
        Ok(())
    }

    /// Approval covers the pool itself, never data found in it at execute time.
    fn destroy_pool(&self, item: &PlanItem) -> StatekeeperResult<()> {
        let prefix = format!("{}/", item.name);
        for child in self.zfs.list_datasets()? {
            if !child.name.starts_with(&prefix) {
                continue;
            }
            let used = self.zfs.dataset_used_bytes(&child.name)?;
            if used > 0 {
                return Err(StatekeeperError::Provider(format!(
                    "safety abort: pool {} contains dataset {} with {} of data; destroy cancelled even though approved, destroy the dataset first",
                    item.name,
                    child.name,
                    humanise_bytes(used)
                )));
            }
        }
        self.zfs.destroy_pool(&item.name)
    }

    fn delete_dataset(&self, item: &PlanItem) -> StatekeeperResult<()> {
        if item.approved {
            return self.zfs.destroy_dataset(&item.name, true);
        }
        let used = self.zfs.dataset_used_bytes(&item.name)?;
        if used > 0 {
            return Err(StatekeeperError::Provider(format!(
                "safety abort: dataset {} now holds {} of data; destroy cancelled, re-plan to review",
                item.name,
                humanise_bytes(used)
            )));
        }
        self.zfs.destroy_dataset(&item.name, false)
    }

    fn delete_share(&self, item: &PlanItem) -> StatekeeperResult<()> {
        if !item.approved {
            let connections = self.shares.active_connections(&item.name)?;
            if connections > 0 {
                return Err(StatekeeperError::Provider(format!(
                    "safety abort: share {} gained {connections} active connection(s) after planning; removal cancelled",
                    item.name
                )));
            }
        }
        self.shares.remove_share(&item.name)?;
        self.shares.reload()
    }
}

/// What actually runs for `item`; approved Blocked items run what was withheld.
fn effective_action(item: &PlanItem) -> PlanAction {
    match item.action {
        PlanAction::Blocked => item.withheld.unwrap_or(PlanAction::Blocked),
        other => other,
    }
}

fn action_label(item: &PlanItem, action: PlanAction) -> String {
    if item.action == PlanAction::Blocked {
        format!("[APPROVED] {action}")
    } else {
        action.to_string()
    }
}

fn missing_spec(item: &PlanItem) -> StatekeeperError {
    StatekeeperError::Provider(format!("plan item {} carries no desired spec", item.key()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::{LiveDataset, LivePool, LiveShare};
    use crate::plan::{FieldChange, RiskLevel};
    use crate::state::{DesiredDataset, DesiredPool, DesiredShare};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
        datasets: Vec<&'static str>,
        used: u64,
        connections: u32,
    }

    impl Recorder {
        fn record(&self, call: String) -> StatekeeperResult<()> {
            if matches!(self.fail_on, Some(prefix) if call.starts_with(prefix)) {
                return Err(StatekeeperError::Provider(format!("{call} failed")));
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ZfsProvider for Recorder {
        fn list_pools(&self) -> StatekeeperResult<Vec<LivePool>> {
            Ok(Vec::new())
        }
        fn list_datasets(&self) -> StatekeeperResult<Vec<LiveDataset>> {
            Ok(self
                .datasets
                .iter()
                .map(|name| LiveDataset {
                    name: name.to_string(),
                    used: self.used,
                    ..LiveDataset::default()
                })
                .collect())
        }
        fn create_pool(&self, pool: &DesiredPool) -> StatekeeperResult<()> {
            self.record(format!("zpool create {}", pool.name))
        }
        fn add_pool_disk(&self, pool: &str, disk: &str) -> StatekeeperResult<()> {
            self.record(format!("zpool add {pool} {disk}"))
        }
        fn remove_pool_disk(&self, pool: &str, disk: &str) -> StatekeeperResult<()> {
            self.record(format!("zpool remove {pool} {disk}"))
        }
        fn destroy_pool(&self, pool: &str) -> StatekeeperResult<()> {
            self.record(format!("zpool destroy {pool}"))
        }
        fn create_dataset(&self, dataset: &DesiredDataset) -> StatekeeperResult<()> {
            self.record(format!("zfs create {}", dataset.name))
        }
        fn set_dataset_property(&self, dataset: &str, property: &str, value: &str) -> StatekeeperResult<()> {
            self.record(format!("zfs set {property}={value} {dataset}"))
        }
        fn destroy_dataset(&self, dataset: &str, recursive: bool) -> StatekeeperResult<()> {
            let flag = if recursive { "-r " } else { "" };
            self.record(format!("zfs destroy {flag}{dataset}"))
        }
        fn dataset_used_bytes(&self, _dataset: &str) -> StatekeeperResult<u64> {
            Ok(self.used)
        }
    }

    impl ShareProvider for Recorder {
        fn list_shares(&self) -> StatekeeperResult<Vec<LiveShare>> {
            Ok(Vec::new())
        }
        fn upsert_share(&self, share: &DesiredShare) -> StatekeeperResult<()> {
            self.record(format!("share upsert {}", share.name))
        }
        fn remove_share(&self, name: &str) -> StatekeeperResult<()> {
            self.record(format!("share remove {name}"))
        }
        fn reload(&self) -> StatekeeperResult<()> {
            self.record("smb reload".to_string())
        }
        fn active_connections(&self, _name: &str) -> StatekeeperResult<u32> {
            Ok(self.connections)
        }
    }

    fn dataset_create(name: &str) -> PlanItem {
        let mut item = PlanItem::new(ResourceKind::Dataset, name, PlanAction::Create, RiskLevel::Low);
        item.desired = Some(DesiredSpec::Dataset(DesiredDataset {
            name: name.into(),
            quota: None,
            compression: None,
            atime: None,
            mountpoint: None,
            encrypted: false,
            properties: BTreeMap::new(),
        }));
        item
    }

    fn share_create(name: &str) -> PlanItem {
        let mut item = PlanItem::new(ResourceKind::Share, name, PlanAction::Create, RiskLevel::Low);
        item.desired = Some(DesiredSpec::Share(DesiredShare {
            name: name.into(),
            path: format!("/tank/{name}"),
            read_only: false,
            valid_users: String::new(),
            comment: String::new(),
            guest_ok: false,
        }));
        item
    }

    fn blocked_delete(kind: ResourceKind, name: &str, approved: bool) -> PlanItem {
        let mut item = PlanItem::new(kind, name, PlanAction::Blocked, RiskLevel::Critical);
        item.withheld = Some(PlanAction::Delete);
        item.block_reason = Some("protected".into());
        item.approved = approved;
        item
    }

    #[test]
    fn unapproved_blocked_item_stops_everything() {
        let host = Recorder::default();
        let plan = Plan::from_items(vec![
            dataset_create("tank/new"),
            blocked_delete(ResourceKind::Dataset, "tank/old", false),
        ]);

        let report = ApplyEngine::new(&host, &host).execute(&plan);
        assert!(!report.success());
        assert!(report.applied.is_empty());
        assert_eq!(report.unapproved, vec!["dataset/tank/old".to_string()]);
        assert!(host.calls().is_empty());
    }

    #[test]
    fn approved_blocked_dataset_is_destroyed_recursively() {
        let host = Recorder::default();
        let plan = Plan::from_items(vec![blocked_delete(ResourceKind::Dataset, "tank/old", true)]);

        let report = ApplyEngine::new(&host, &host).execute(&plan);
        assert!(report.success());
        assert_eq!(report.applied[0].action, PlanAction::Delete);
        assert!(report.applied[0].approved);
        assert_eq!(host.calls(), vec!["zfs destroy -r tank/old".to_string()]);
    }

    #[test]
    fn executes_in_plan_order_with_share_reload() {
        let host = Recorder::default();
        let mut modify = PlanItem::new(ResourceKind::Dataset, "tank/media", PlanAction::Modify, RiskLevel::Low);
        modify.changes.push(FieldChange::new("quota", "none", "2T"));
        let plan = Plan::from_items(vec![
            dataset_create("tank/new"),
            modify,
            PlanItem::new(ResourceKind::Dataset, "tank/keep", PlanAction::Nop, RiskLevel::Low),
            share_create("media"),
        ]);

        let report = ApplyEngine::new(&host, &host).execute(&plan);
        assert!(report.success());
        assert_eq!(report.applied.len(), 3);
        assert_eq!(
            host.calls(),
            vec![
                "zfs create tank/new".to_string(),
                "zfs set quota=2T tank/media".to_string(),
                "share upsert media".to_string(),
                "smb reload".to_string(),
            ]
        );
    }

    #[test]
    fn first_failure_halts_and_marks_the_rest_not_attempted() {
        let host = Recorder {
            fail_on: Some("zfs create tank/b"),
            ..Recorder::default()
        };
        let plan = Plan::from_items(vec![
            dataset_create("tank/a"),
            dataset_create("tank/b"),
            share_create("media"),
        ]);

        let report = ApplyEngine::new(&host, &host).execute(&plan);
        assert!(!report.success());
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].key, "dataset/tank/a");
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].key, "dataset/tank/b");
        assert!(report.failed[0].reason.contains("failed"));
        assert_eq!(report.failed[1].key, "share/media");
        assert!(report.failed[1].reason.starts_with("not attempted"));
        assert_eq!(host.calls(), vec!["zfs create tank/a".to_string()]);
    }

    #[test]
    fn plain_delete_rechecks_protection_at_execute_time() {
        let host = Recorder {
            used: 8192,
            connections: 2,
            ..Recorder::default()
        };
        let plan = Plan::from_items(vec![PlanItem::new(
            ResourceKind::Dataset,
            "tank/old",
            PlanAction::Delete,
            RiskLevel::Medium,
        )]);
        let report = ApplyEngine::new(&host, &host).execute(&plan);
        assert!(report.failed[0].reason.contains("safety abort"));
        assert!(host.calls().is_empty());

        let plan = Plan::from_items(vec![PlanItem::new(
            ResourceKind::Share,
            "media",
            PlanAction::Delete,
            RiskLevel::Low,
        )]);
        let report = ApplyEngine::new(&host, &host).execute(&plan);
        assert!(report.failed[0].reason.contains("2 active connection(s)"));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn approved_encryption_mismatch_applies_only_settable_fields() {
        let host = Recorder::default();
        let mut item = PlanItem::new(ResourceKind::Dataset, "tank/secure", PlanAction::Blocked, RiskLevel::High);
        item.withheld = Some(PlanAction::Modify);
        item.approved = true;
        item.changes.push(FieldChange::new("encryption", "off", "on"));
        item.changes.push(FieldChange::new("compression", "lz4", "zstd"));

        let report = ApplyEngine::new(&host, &host).execute(&Plan::from_items(vec![item]));
        assert!(report.success());
        assert_eq!(
            host.calls(),
            vec!["zfs set compression=zstd tank/secure".to_string()]
        );
    }

    #[test]
    fn approved_pool_disk_removal_runs_zpool_remove() {
        let host = Recorder::default();
        let mut item = PlanItem::new(ResourceKind::Pool, "tank", PlanAction::Blocked, RiskLevel::Critical);
        item.withheld = Some(PlanAction::Modify);
        item.approved = true;
        item.changes.push(FieldChange::new("disk-remove", "/dev/disk/by-id/ata-B", ""));
        let report = ApplyEngine::new(&host, &host).execute(&Plan::from_items(vec![item]));
        assert!(report.success());
        assert_eq!(
            host.calls(),
            vec!["zpool remove tank /dev/disk/by-id/ata-B".to_string()]
        );
    }

    #[test]
    fn approved_pool_destroy_aborts_when_a_child_dataset_holds_data() {
        let host = Recorder {
            datasets: vec!["tank", "tank/media", "tankette/other"],
            used: 5 << 30,
            ..Recorder::default()
        };
        let plan = Plan::from_items(vec![blocked_delete(ResourceKind::Pool, "tank", true)]);

        let report = ApplyEngine::new(&host, &host).execute(&plan);
        assert!(!report.success());
        assert_eq!(report.failed[0].key, "pool/tank");
        assert!(report.failed[0].reason.contains("tank/media"));
        assert!(report.failed[0].reason.contains("safety abort"));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn approved_pool_destroy_runs_when_children_are_empty() {
        let host = Recorder {
            datasets: vec!["tank", "tank/empty"],
            ..Recorder::default()
        };
        let plan = Plan::from_items(vec![blocked_delete(ResourceKind::Pool, "tank", true)]);

        let report = ApplyEngine::new(&host, &host).execute(&plan);
        assert!(report.success());
        assert_eq!(host.calls(), vec!["zpool destroy tank".to_string()]);
    }

    #[test]
    fn report_serialises_duration_in_millis() {
        let report = ApplyReport {
            duration: Duration::from_millis(1500),
            ..ApplyReport::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["duration_ms"], 1500);
    }
}
