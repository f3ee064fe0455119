use crate::error::StatekeeperResult;
use crate::live::{LiveDataset, LivePool, LiveShare};
use crate::state::{DesiredDataset, DesiredPool, DesiredShare};

/// Abstraction over the `zfs`/`zpool` command surface.
///
/// Implementations are expected to provide a thin, testable layer over the
/// host so the reconciliation engine can be exercised without real pools.
/// Read methods must not mutate anything.
pub trait ZfsProvider: Send + Sync {
    /// Every imported pool with its health and by-id member disks.
    fn list_pools(&self) -> StatekeeperResult<Vec<LivePool>>;

    /// Every filesystem dataset, pool roots included, with the protection
    /// signals (`used`, snapshot count) and locally set properties.
    fn list_datasets(&self) -> StatekeeperResult<Vec<LiveDataset>>;

    fn create_pool(&self, pool: &DesiredPool) -> StatekeeperResult<()>;

    /// Extend `pool` with one more top-level disk.
    fn add_pool_disk(&self, pool: &str, disk: &str) -> StatekeeperResult<()>;

    fn remove_pool_disk(&self, pool: &str, disk: &str) -> StatekeeperResult<()>;

    fn destroy_pool(&self, pool: &str) -> StatekeeperResult<()>;

    /// Create `dataset` (and any missing parents) with its declared properties.
    fn create_dataset(&self, dataset: &DesiredDataset) -> StatekeeperResult<()>;

    fn set_dataset_property(&self, dataset: &str, property: &str, value: &str)
        -> StatekeeperResult<()>;

    /// Destroy `dataset`; `recursive` also removes children and snapshots.
    fn destroy_dataset(&self, dataset: &str, recursive: bool) -> StatekeeperResult<()>;

    /// Current `used` bytes for `dataset`, queried fresh.
    fn dataset_used_bytes(&self, dataset: &str) -> StatekeeperResult<u64>;
}

/// Abstraction over the SMB share registry and the running Samba server.
pub trait ShareProvider: Send + Sync {
    /// Every registered share, each carrying its active connection count.
    fn list_shares(&self) -> StatekeeperResult<Vec<LiveShare>>;

    /// Insert or replace the registry row for `share`.
    fn upsert_share(&self, share: &DesiredShare) -> StatekeeperResult<()>;

    fn remove_share(&self, name: &str) -> StatekeeperResult<()>;

    /// Re-render the server configuration and ask the server to reload it.
    fn reload(&self) -> StatekeeperResult<()>;

    /// Number of clients currently connected to `name`, queried fresh.
    fn active_connections(&self, name: &str) -> StatekeeperResult<u32>;
}
