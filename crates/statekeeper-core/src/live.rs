//! Snapshot of what the host actually has, read fresh for every plan.

use crate::error::{StatekeeperError, StatekeeperResult};
use crate::provider::{ShareProvider, ZfsProvider};
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LivePool {
    pub name: String,
    /// ONLINE, DEGRADED, FAULTED, ...; reported, never managed.
    pub health: String,
    /// Member disks that appear under `/dev/disk/by-id/`.
    pub disks: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveDataset {
    pub name: String,
    pub used: u64,
    pub available: u64,
    pub compression: String,
    pub atime: String,
    pub mountpoint: String,
    /// Bytes; 0 when no quota is set.
    pub quota: u64,
    pub encrypted: bool,
    /// Direct child filesystems.
    pub child_count: usize,
    pub snapshot_count: usize,
    /// Properties set locally or received, keyed by ZFS property name.
    pub properties: BTreeMap<String, String>,
}

impl LiveDataset {
    /// Pool root datasets belong to their pool and are never deleted on their own.
    pub fn is_pool_root(&self) -> bool {
        !self.name.contains('/')
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveShare {
    pub name: String,
    pub path: String,
    pub read_only: bool,
    pub valid_users: String,
    pub comment: String,
    pub guest_ok: bool,
    pub active_connections: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveState {
    pub pools: Vec<LivePool>,
    pub datasets: Vec<LiveDataset>,
    pub shares: Vec<LiveShare>,
}

/// Reads pools, datasets and shares through the providers.
///
/// The read is atomic: if any subsystem cannot be queried the whole read
/// fails, so a plan is never computed against a partial picture.
pub struct LiveStateReader<'a, Z: ZfsProvider, S: ShareProvider> {
    zfs: &'a Z,
    shares: &'a S,
}

impl<'a, Z: ZfsProvider, S: ShareProvider> LiveStateReader<'a, Z, S> {
    pub fn new(zfs: &'a Z, shares: &'a S) -> Self {
        Self { zfs, shares }
    }

    pub fn read(&self) -> StatekeeperResult<LiveState> {
        let pools = self.zfs.list_pools().map_err(|err| live_read("pool", err))?;
        let mut datasets = self
            .zfs
            .list_datasets()
            .map_err(|err| live_read("dataset", err))?;
        let shares = self
            .shares
            .list_shares()
            .map_err(|err| live_read("share", err))?;

        assign_child_counts(&mut datasets);
        debug!(
            "live state read: {} pool(s), {} dataset(s), {} share(s)",
            pools.len(),
            datasets.len(),
            shares.len()
        );

        Ok(LiveState {
            pools,
            datasets,
            shares,
        })
    }
}

fn live_read(subsystem: &'static str, err: StatekeeperError) -> StatekeeperError {
    match err {
        already @ StatekeeperError::LiveRead { .. } => already,
        other => StatekeeperError::LiveRead {
            subsystem,
            reason: other.to_string(),
        },
    }
}

/// Count direct children from the dataset names themselves.
fn assign_child_counts(datasets: &mut [LiveDataset]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for dataset in datasets.iter() {
        if let Some((parent, _)) = dataset.name.rsplit_once('/') {
            *counts.entry(parent.to_string()).or_default() += 1;
        }
    }
    for dataset in datasets.iter_mut() {
        dataset.child_count = counts.get(&dataset.name).copied().unwrap_or(0);
    }
}
