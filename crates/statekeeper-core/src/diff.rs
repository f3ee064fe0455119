//! Diff engine: compares desired against live and classifies every entity.
//!
//! Pure and deterministic. It never calls out to the host; both inputs are
//! already materialised snapshots, so it is safe to run concurrently.

use crate::live::{LiveDataset, LivePool, LiveShare, LiveState};
use crate::plan::{DesiredSpec, FieldChange, Plan, PlanAction, PlanItem, ResourceKind, RiskLevel};
use crate::state::{DesiredDataset, DesiredPool, DesiredShare, DesiredState};
use crate::units::{humanise_bytes, parse_size};
use std::collections::{HashMap, HashSet};

/// Compute the reconciliation plan. Items come out pools first, then
/// datasets, then shares.
pub fn compute_diff(desired: &DesiredState, live: &LiveState) -> Plan {
    let mut items = diff_pools(&desired.pools, &live.pools);
    items.extend(diff_datasets(&desired.datasets, &live.datasets));
    items.extend(diff_shares(&desired.shares, &live.shares));
    Plan::from_items(items)
}

fn depth(name: &str) -> usize {
    name.matches('/').count()
}

fn create_item(kind: ResourceKind, name: &str, spec: DesiredSpec) -> PlanItem {
    let mut item = PlanItem::new(kind, name, PlanAction::Create, RiskLevel::Low);
    item.desired = Some(spec);
    item
}

fn blocked_item(
    kind: ResourceKind,
    name: &str,
    withheld: PlanAction,
    risk: RiskLevel,
    reason: String,
) -> PlanItem {
    let mut item = PlanItem::new(kind, name, PlanAction::Blocked, risk);
    item.withheld = Some(withheld);
    item.block_reason = Some(reason);
    item
}

// ── pools ────────────────────────────────────────────────────────────────────

fn diff_pools(desired: &[DesiredPool], live: &[LivePool]) -> Vec<PlanItem> {
    let live_index: HashMap<&str, &LivePool> = live.iter().map(|p| (p.name.as_str(), p)).collect();
    let wanted: HashSet<&str> = desired.iter().map(|p| p.name.as_str()).collect();

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    for pool in desired {
        match live_index.get(pool.name.as_str()) {
            None => creates.push(create_item(
                ResourceKind::Pool,
                &pool.name,
                DesiredSpec::Pool(pool.clone()),
            )),
            Some(current) => updates.push(compare_pool(pool, current)),
        }
    }

    let mut removals: Vec<PlanItem> = live
        .iter()
        .filter(|p| !wanted.contains(p.name.as_str()))
        .map(pool_removal)
        .collect();
    removals.sort_by(|a, b| a.name.cmp(&b.name));

    creates.into_iter().chain(updates).chain(removals).collect()
}

fn compare_pool(desired: &DesiredPool, live: &LivePool) -> PlanItem {
    // Without by-id members on the live side membership cannot be compared.
    if live.disks.is_empty() {
        return PlanItem::new(ResourceKind::Pool, &desired.name, PlanAction::Nop, RiskLevel::Low);
    }

    let live_disks: HashSet<&str> = live.disks.iter().map(String::as_str).collect();
    let desired_disks: HashSet<&str> = desired.disks.iter().map(String::as_str).collect();

    let mut changes: Vec<FieldChange> = desired
        .disks
        .iter()
        .filter(|disk| !live_disks.contains(disk.as_str()))
        .map(|disk| FieldChange::new("disk-add", "", disk.as_str()))
        .collect();
    let removed: Vec<&str> = live
        .disks
        .iter()
        .map(String::as_str)
        .filter(|disk| !desired_disks.contains(disk))
        .collect();
    changes.extend(
        removed
            .iter()
            .map(|disk| FieldChange::new("disk-remove", *disk, "")),
    );

    if changes.is_empty() {
        return PlanItem::new(ResourceKind::Pool, &desired.name, PlanAction::Nop, RiskLevel::Low);
    }

    let mut item = if removed.is_empty() {
        PlanItem::new(ResourceKind::Pool, &desired.name, PlanAction::Modify, RiskLevel::Medium)
    } else {
        blocked_item(
            ResourceKind::Pool,
            &desired.name,
            PlanAction::Modify,
            RiskLevel::Critical,
            format!(
                "Pool {:?} has member disk(s) not declared in the desired state: {}. \
                 Removing a disk from a live pool reduces redundancy and is not possible \
                 for every vdev layout. Check `zpool status {}` and approve only if the \
                 removal is intended.",
                desired.name,
                removed.join(", "),
                desired.name
            ),
        )
    };
    item.changes = changes;
    item.desired = Some(DesiredSpec::Pool(desired.clone()));
    item
}

fn pool_removal(live: &LivePool) -> PlanItem {
    blocked_item(
        ResourceKind::Pool,
        &live.name,
        PlanAction::Delete,
        RiskLevel::Critical,
        format!(
            "Pool {:?} exists on the system but not in the desired state. \
             Destroying a pool destroys every dataset and snapshot inside it, so it \
             never happens automatically. Migrate the data, then export or destroy \
             the pool manually (`zpool export {}`), or approve this item.",
            live.name, live.name
        ),
    )
}

// ── datasets ─────────────────────────────────────────────────────────────────

fn diff_datasets(desired: &[DesiredDataset], live: &[LiveDataset]) -> Vec<PlanItem> {
    let live_index: HashMap<&str, &LiveDataset> =
        live.iter().map(|d| (d.name.as_str(), d)).collect();
    let wanted: HashSet<&str> = desired.iter().map(|d| d.name.as_str()).collect();

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    for dataset in desired {
        match live_index.get(dataset.name.as_str()) {
            None => creates.push(create_item(
                ResourceKind::Dataset,
                &dataset.name,
                DesiredSpec::Dataset(dataset.clone()),
            )),
            Some(current) => updates.push(compare_dataset(dataset, current)),
        }
    }
    // Parents before children; stable so desired order breaks ties.
    creates.sort_by_key(|item| depth(&item.name));

    let mut removals: Vec<PlanItem> = live
        .iter()
        .filter(|d| !d.is_pool_root() && !wanted.contains(d.name.as_str()))
        .map(dataset_removal)
        .collect();
    removals.sort_by(|a, b| {
        depth(&b.name)
            .cmp(&depth(&a.name))
            .then_with(|| a.name.cmp(&b.name))
    });

    creates.into_iter().chain(updates).chain(removals).collect()
}

fn quota_display(bytes: u64) -> String {
    if bytes == 0 {
        "none".to_string()
    } else {
        humanise_bytes(bytes)
    }
}

/// Values are equal when the strings match or both parse to the same size.
fn values_match(desired: &str, live: &str) -> bool {
    if desired == live {
        return true;
    }
    matches!((parse_size(desired), parse_size(live)), (Some(a), Some(b)) if a == b)
}

fn dataset_changes(desired: &DesiredDataset, live: &LiveDataset) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    let scalar_fields = [
        ("compression", desired.compression.as_deref(), live.compression.as_str()),
        ("atime", desired.atime.as_deref(), live.atime.as_str()),
        ("mountpoint", desired.mountpoint.as_deref(), live.mountpoint.as_str()),
    ];
    for (field, wanted, current) in scalar_fields {
        if let Some(wanted) = wanted {
            if wanted != current {
                changes.push(FieldChange::new(field, current, wanted));
            }
        }
    }

    if let Some(quota) = &desired.quota {
        let wanted = parse_size(quota).unwrap_or(0);
        if wanted != live.quota {
            changes.push(FieldChange::new("quota", quota_display(live.quota), quota.as_str()));
        }
    }

    for (property, wanted) in &desired.properties {
        let current = live.properties.get(property).map(String::as_str).unwrap_or("");
        if !values_match(wanted, current) {
            changes.push(FieldChange::new(property.as_str(), current, wanted.as_str()));
        }
    }

    changes
}

fn compare_dataset(desired: &DesiredDataset, live: &LiveDataset) -> PlanItem {
    let mut changes = dataset_changes(desired, live);
    // Only a declared `encrypted: true` is compared; children of an encrypted
    // parent report encryption without declaring it.
    if desired.encrypted && !live.encrypted {
        changes.insert(0, FieldChange::new("encryption", "off", "on"));
        let mut item = blocked_item(
            ResourceKind::Dataset,
            &desired.name,
            PlanAction::Modify,
            RiskLevel::Critical,
            format!(
                "Dataset {:?} is declared encrypted but exists unencrypted. Encryption \
                 can only be chosen at creation: copy the data into a new encrypted \
                 dataset and swap it in manually. Approving applies the remaining \
                 changes and leaves encryption untouched.",
                desired.name
            ),
        );
        item.changes = changes;
        item.desired = Some(DesiredSpec::Dataset(desired.clone()));
        return item;
    }
    if changes.is_empty() {
        return PlanItem::new(ResourceKind::Dataset, &desired.name, PlanAction::Nop, RiskLevel::Low);
    }
    let risk = if changes.iter().any(|c| c.field == "mountpoint") {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    let mut item = PlanItem::new(ResourceKind::Dataset, &desired.name, PlanAction::Modify, risk);
    item.changes = changes;
    item.desired = Some(DesiredSpec::Dataset(desired.clone()));
    item
}

fn dataset_removal(live: &LiveDataset) -> PlanItem {
    let mut signals = Vec::new();
    if live.used > 0 {
        signals.push(format!("{} of used data", humanise_bytes(live.used)));
    }
    if live.child_count > 0 {
        signals.push(format!("{} child dataset(s)", live.child_count));
    }
    if live.snapshot_count > 0 {
        signals.push(format!("{} snapshot(s)", live.snapshot_count));
    }

    if signals.is_empty() {
        return PlanItem::new(ResourceKind::Dataset, &live.name, PlanAction::Delete, RiskLevel::Medium);
    }

    blocked_item(
        ResourceKind::Dataset,
        &live.name,
        PlanAction::Delete,
        RiskLevel::Critical,
        format!(
            "Dataset {:?} has {} and cannot be destroyed automatically. \
             To resolve: (1) verify the data is no longer needed, \
             (2) take a snapshot elsewhere if you want a recovery point, \
             (3) approve this item to destroy it recursively, or run `zfs destroy -r {}` \
             manually and re-plan.",
            live.name,
            signals.join(", "),
            live.name
        ),
    )
}

// ── shares ───────────────────────────────────────────────────────────────────

fn diff_shares(desired: &[DesiredShare], live: &[LiveShare]) -> Vec<PlanItem> {
    let live_index: HashMap<&str, &LiveShare> = live.iter().map(|s| (s.name.as_str(), s)).collect();
    let wanted: HashSet<&str> = desired.iter().map(|s| s.name.as_str()).collect();

    let mut creates = Vec::new();
    let mut updates = Vec::new();
    for share in desired {
        match live_index.get(share.name.as_str()) {
            None => creates.push(create_item(
                ResourceKind::Share,
                &share.name,
                DesiredSpec::Share(share.clone()),
            )),
            Some(current) => updates.push(compare_share(share, current)),
        }
    }

    let mut removals: Vec<PlanItem> = live
        .iter()
        .filter(|s| !wanted.contains(s.name.as_str()))
        .map(share_removal)
        .collect();
    removals.sort_by(|a, b| a.name.cmp(&b.name));

    creates.into_iter().chain(updates).chain(removals).collect()
}

fn share_changes(desired: &DesiredShare, live: &LiveShare) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    if desired.path != live.path {
        changes.push(FieldChange::new("path", live.path.as_str(), desired.path.as_str()));
    }
    if desired.read_only != live.read_only {
        changes.push(FieldChange::new(
            "read_only",
            live.read_only.to_string(),
            desired.read_only.to_string(),
        ));
    }
    if desired.valid_users != live.valid_users {
        changes.push(FieldChange::new(
            "valid_users",
            live.valid_users.as_str(),
            desired.valid_users.as_str(),
        ));
    }
    if desired.comment != live.comment {
        changes.push(FieldChange::new("comment", live.comment.as_str(), desired.comment.as_str()));
    }
    if desired.guest_ok != live.guest_ok {
        changes.push(FieldChange::new(
            "guest_ok",
            live.guest_ok.to_string(),
            desired.guest_ok.to_string(),
        ));
    }
    changes
}

fn connected_reason(name: &str, connections: u32, verb: &str) -> String {
    format!(
        "Share {name:?} has {connections} active client connection(s) and cannot be {verb} \
         while in use; clients with open files may lose unsaved work. Wait for clients to \
         disconnect or notify users, then re-plan, or approve this item."
    )
}

fn compare_share(desired: &DesiredShare, live: &LiveShare) -> PlanItem {
    let changes = share_changes(desired, live);
    if changes.is_empty() {
        return PlanItem::new(ResourceKind::Share, &desired.name, PlanAction::Nop, RiskLevel::Low);
    }
    let mut item = if live.active_connections > 0 {
        blocked_item(
            ResourceKind::Share,
            &desired.name,
            PlanAction::Modify,
            RiskLevel::High,
            connected_reason(&desired.name, live.active_connections, "modified"),
        )
    } else {
        PlanItem::new(ResourceKind::Share, &desired.name, PlanAction::Modify, RiskLevel::Low)
    };
    item.changes = changes;
    item.desired = Some(DesiredSpec::Share(desired.clone()));
    item
}

fn share_removal(live: &LiveShare) -> PlanItem {
    if live.active_connections > 0 {
        return blocked_item(
            ResourceKind::Share,
            &live.name,
            PlanAction::Delete,
            RiskLevel::High,
            connected_reason(&live.name, live.active_connections, "removed"),
        );
    }
    PlanItem::new(ResourceKind::Share, &live.name, PlanAction::Delete, RiskLevel::Low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const TIB: u64 = 1024 * 1024 * 1024 * 1024;

    fn desired() -> DesiredState {
        DesiredState {
            version: "1".into(),
            pools: Vec::new(),
            datasets: Vec::new(),
            shares: Vec::new(),
        }
    }

    fn dataset(name: &str) -> DesiredDataset {
        DesiredDataset {
            name: name.into(),
            quota: None,
            compression: None,
            atime: None,
            mountpoint: None,
            encrypted: false,
            properties: BTreeMap::new(),
        }
    }

    fn live_dataset(name: &str, used: u64) -> LiveDataset {
        LiveDataset {
            name: name.into(),
            used,
            compression: "lz4".into(),
            atime: "off".into(),
            mountpoint: format!("/{name}"),
            ..LiveDataset::default()
        }
    }

    fn share(name: &str, path: &str) -> DesiredShare {
        DesiredShare {
            name: name.into(),
            path: path.into(),
            read_only: false,
            valid_users: String::new(),
            comment: String::new(),
            guest_ok: false,
        }
    }

    fn live_share(name: &str, path: &str, connections: u32) -> LiveShare {
        LiveShare {
            name: name.into(),
            path: path.into(),
            active_connections: connections,
            ..LiveShare::default()
        }
    }

    fn disk(serial: &str) -> String {
        format!("/dev/disk/by-id/ata-{serial}")
    }

    fn pool(name: &str, disks: &[&str]) -> DesiredPool {
        DesiredPool {
            name: name.into(),
            vdev_type: "mirror".into(),
            disks: disks.iter().map(|d| disk(d)).collect(),
            ashift: 12,
            options: BTreeMap::new(),
        }
    }

    fn live_pool(name: &str, disks: &[&str]) -> LivePool {
        LivePool {
            name: name.into(),
            health: "ONLINE".into(),
            disks: disks.iter().map(|d| disk(d)).collect(),
        }
    }

    #[test]
    fn missing_dataset_is_created() {
        let mut want = desired();
        let mut data = dataset("tank/data");
        data.quota = Some("2T".into());
        want.datasets.push(data);
        let live = LiveState {
            datasets: vec![live_dataset("tank", 1)],
            ..LiveState::default()
        };

        let plan = compute_diff(&want, &live);
        assert_eq!(plan.items.len(), 1);
        let item = &plan.items[0];
        assert_eq!(item.kind, ResourceKind::Dataset);
        assert_eq!(item.name, "tank/data");
        assert_eq!(item.action, PlanAction::Create);
        assert!(matches!(item.desired, Some(DesiredSpec::Dataset(_))));
        assert_eq!(plan.summary.create_count, 1);
        assert!(plan.summary.safe_to_apply);
    }

    #[test]
    fn undeclared_dataset_with_data_is_blocked() {
        let live = LiveState {
            datasets: vec![live_dataset("tank", 1), live_dataset("tank/old", 4096)],
            ..LiveState::default()
        };
        let plan = compute_diff(&desired(), &live);
        let item = plan.find(ResourceKind::Dataset, "tank/old").unwrap();
        assert_eq!(item.action, PlanAction::Blocked);
        assert_eq!(item.withheld, Some(PlanAction::Delete));
        assert_eq!(item.risk_level, RiskLevel::Critical);
        assert!(item.block_reason.as_deref().unwrap().contains("4.0 KiB"));
        assert!(plan.summary.has_blocked);
        assert!(!plan.summary.safe_to_apply);
        assert_eq!(plan.unapproved_blocked(), vec!["dataset/tank/old".to_string()]);
    }

    #[test]
    fn pool_roots_are_never_delete_candidates() {
        let live = LiveState {
            datasets: vec![live_dataset("tank", 0)],
            ..LiveState::default()
        };
        assert!(compute_diff(&desired(), &live).items.is_empty());
    }

    #[test]
    fn empty_dataset_is_deleted_and_children_or_snapshots_block() {
        let mut parent = live_dataset("tank/a", 0);
        parent.child_count = 1;
        let mut snapped = live_dataset("tank/b", 0);
        snapped.snapshot_count = 3;
        let live = LiveState {
            datasets: vec![parent, live_dataset("tank/a/c", 0), snapped],
            ..LiveState::default()
        };

        let plan = compute_diff(&desired(), &live);
        let names: Vec<&str> = plan.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["tank/a/c", "tank/a", "tank/b"]);
        assert_eq!(plan.items[0].action, PlanAction::Delete);
        assert_eq!(plan.items[0].risk_level, RiskLevel::Medium);
        assert_eq!(plan.items[1].action, PlanAction::Blocked);
        assert!(plan.items[1].block_reason.as_deref().unwrap().contains("1 child dataset(s)"));
        assert_eq!(plan.items[2].action, PlanAction::Blocked);
        assert!(plan.items[2].block_reason.as_deref().unwrap().contains("3 snapshot(s)"));
    }

    #[test]
    fn identical_entities_are_nop() {
        let mut want = desired();
        let mut data = dataset("tank/data");
        data.quota = Some("2T".into());
        data.compression = Some("lz4".into());
        data.properties.insert("recordsize".into(), "1M".into());
        want.datasets.push(data);
        want.shares.push(share("media", "/tank/data"));
        want.pools.push(pool("tank", &["A", "B"]));

        let mut current = live_dataset("tank/data", 10);
        current.quota = 2 * TIB;
        current.properties.insert("recordsize".into(), "1048576".into());
        let live = LiveState {
            pools: vec![live_pool("tank", &["B", "A"])],
            datasets: vec![live_dataset("tank", 10), current],
            shares: vec![live_share("media", "/tank/data", 2)],
        };

        let plan = compute_diff(&want, &live);
        assert_eq!(plan.items.len(), 3);
        assert!(plan.is_converged());
        assert!(!plan.is_drifted());
    }

    #[test]
    fn dataset_fields_produce_modify_with_changes() {
        let mut want = desired();
        let mut data = dataset("tank/data");
        data.compression = Some("zstd".into());
        data.mountpoint = Some("/srv/data".into());
        data.quota = Some("none".into());
        want.datasets.push(data);

        let mut current = live_dataset("tank/data", 10);
        current.quota = TIB;
        let live = LiveState {
            datasets: vec![current],
            ..LiveState::default()
        };

        let plan = compute_diff(&want, &live);
        let item = &plan.items[0];
        assert_eq!(item.action, PlanAction::Modify);
        assert_eq!(item.risk_level, RiskLevel::Medium);
        let rendered: Vec<String> = item.changes.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "compression: lz4 → zstd".to_string(),
                "mountpoint: /tank/data → /srv/data".to_string(),
                "quota: 1.0 TiB → none".to_string(),
            ]
        );
    }

    #[test]
    fn declared_encryption_on_a_plain_dataset_is_blocked() {
        let mut want = desired();
        let mut secure = dataset("tank/secure");
        secure.encrypted = true;
        want.datasets.push(secure);
        want.datasets.push(dataset("tank/secure/child"));

        let mut child = live_dataset("tank/secure/child", 0);
        child.encrypted = true;
        let live = LiveState {
            datasets: vec![live_dataset("tank/secure", 0), child],
            ..LiveState::default()
        };

        let plan = compute_diff(&want, &live);
        let item = plan.find(ResourceKind::Dataset, "tank/secure").unwrap();
        assert_eq!(item.action, PlanAction::Blocked);
        assert_eq!(item.withheld, Some(PlanAction::Modify));
        assert_eq!(item.risk_level, RiskLevel::Critical);
        assert_eq!(item.changes[0].to_string(), "encryption: off → on");
        assert!(item.block_reason.as_deref().unwrap().contains("only be chosen at creation"));

        let child = plan.find(ResourceKind::Dataset, "tank/secure/child").unwrap();
        assert_eq!(child.action, PlanAction::Nop);
    }

    #[test]
    fn creates_are_ordered_parent_first() {
        let mut want = desired();
        want.datasets.push(dataset("tank/a/b"));
        want.datasets.push(dataset("tank/z"));
        want.datasets.push(dataset("tank/a"));
        let plan = compute_diff(&want, &LiveState::default());
        let names: Vec<&str> = plan.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["tank/z", "tank/a", "tank/a/b"]);
    }

    #[test]
    fn kinds_are_emitted_in_dependency_order() {
        let mut want = desired();
        want.shares.push(share("media", "/tank/media"));
        want.datasets.push(dataset("tank/media"));
        want.pools.push(pool("tank", &["A"]));
        let plan = compute_diff(&want, &LiveState::default());
        let kinds: Vec<ResourceKind> = plan.items.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![ResourceKind::Pool, ResourceKind::Dataset, ResourceKind::Share]
        );
    }

    #[test]
    fn undeclared_pool_is_always_blocked() {
        let live = LiveState {
            pools: vec![live_pool("scratch", &[])],
            ..LiveState::default()
        };
        let plan = compute_diff(&desired(), &live);
        let item = &plan.items[0];
        assert_eq!(item.action, PlanAction::Blocked);
        assert_eq!(item.withheld, Some(PlanAction::Delete));
        assert_eq!(item.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn pool_disk_add_is_modify_and_removal_is_blocked() {
        let mut want = desired();
        want.pools.push(pool("tank", &["A", "B", "C"]));
        let live = LiveState {
            pools: vec![live_pool("tank", &["A", "B"])],
            ..LiveState::default()
        };
        let plan = compute_diff(&want, &live);
        assert_eq!(plan.items[0].action, PlanAction::Modify);
        assert_eq!(plan.items[0].risk_level, RiskLevel::Medium);
        assert_eq!(plan.items[0].changes[0].field, "disk-add");

        let mut want = desired();
        want.pools.push(pool("tank", &["A"]));
        let plan = compute_diff(&want, &live);
        let item = &plan.items[0];
        assert_eq!(item.action, PlanAction::Blocked);
        assert_eq!(item.withheld, Some(PlanAction::Modify));
        assert_eq!(item.changes[0].field, "disk-remove");
        assert_eq!(item.changes[0].live, disk("B"));
    }

    #[test]
    fn pool_without_by_id_members_is_not_compared() {
        let mut want = desired();
        want.pools.push(pool("tank", &["A"]));
        let live = LiveState {
            pools: vec![live_pool("tank", &[])],
            ..LiveState::default()
        };
        assert_eq!(compute_diff(&want, &live).items[0].action, PlanAction::Nop);
    }

    #[test]
    fn shares_with_connections_block_delete_and_modify() {
        let mut want = desired();
        want.shares.push(share("media", "/tank/new"));
        let live = LiveState {
            shares: vec![
                live_share("media", "/tank/media", 1),
                live_share("busy", "/tank/busy", 4),
                live_share("idle", "/tank/idle", 0),
            ],
            ..LiveState::default()
        };
        let plan = compute_diff(&want, &live);

        let media = plan.find(ResourceKind::Share, "media").unwrap();
        assert_eq!(media.action, PlanAction::Blocked);
        assert_eq!(media.withheld, Some(PlanAction::Modify));
        assert_eq!(media.risk_level, RiskLevel::High);

        let busy = plan.find(ResourceKind::Share, "busy").unwrap();
        assert_eq!(busy.action, PlanAction::Blocked);
        assert!(busy.block_reason.as_deref().unwrap().contains("4 active"));

        let idle = plan.find(ResourceKind::Share, "idle").unwrap();
        assert_eq!(idle.action, PlanAction::Delete);
        assert_eq!(idle.risk_level, RiskLevel::Low);
    }

    #[test]
    fn diff_is_deterministic() {
        let mut want = desired();
        want.datasets.push(dataset("tank/new"));
        want.shares.push(share("media", "/tank/media"));
        let live = LiveState {
            pools: vec![live_pool("old", &["X"])],
            datasets: vec![live_dataset("tank/b", 1), live_dataset("tank/a", 0)],
            shares: vec![live_share("media", "/elsewhere", 0)],
        };
        assert_eq!(compute_diff(&want, &live), compute_diff(&want, &live));
    }
}
