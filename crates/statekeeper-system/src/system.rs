//! System-backed `ZfsProvider`. Shells out to the platform `zfs` and `zpool`
//! binaries for both the live-state reads and the apply mutations.

use crate::command::{CommandClass, CommandRunner, Output};
use crate::parse::{
    count_snapshots, group_properties, parse_bytes, parse_pool_disks, parse_property_rows,
    parse_tabular_pairs,
};
use log::{debug, info};
use statekeeper_core::config::{EncryptionCfg, StatekeeperConfig};
use statekeeper_core::error::{StatekeeperError, StatekeeperResult};
use statekeeper_core::live::{LiveDataset, LivePool};
use statekeeper_core::provider::ZfsProvider;
use statekeeper_core::state::{DesiredDataset, DesiredPool, BY_ID_PREFIX};
use std::path::PathBuf;
use std::time::Duration;

/// Default locations probed for a `zfs` binary.
pub const DEFAULT_ZFS_PATHS: &[&str] = &[
    "/sbin/zfs",
    "/usr/sbin/zfs",
    "/usr/local/sbin/zfs",
    "/bin/zfs",
];

/// Default locations probed for a `zpool` binary.
pub const DEFAULT_ZPOOL_PATHS: &[&str] = &[
    "/sbin/zpool",
    "/usr/sbin/zpool",
    "/usr/local/sbin/zpool",
    "/bin/zpool",
];

/// Properties read for every filesystem in one `zfs get` call.
const LIVE_PROPERTIES: &str = "used,available,compression,atime,mountpoint,quota,encryption";

#[derive(Clone)]
pub struct SystemZfsProvider {
    zfs: CommandRunner,
    zpool: CommandRunner,
    encryption: EncryptionCfg,
}

/// Where an encrypted dataset gets its key from at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeySource<'a> {
    /// The parent is encrypted; the child inherits its encryption root.
    Inherit,
    /// The dataset becomes a new encryption root.
    NewRoot {
        algorithm: &'a str,
        keyformat: &'a str,
        keylocation: &'a str,
    },
}

impl SystemZfsProvider {
    /// Build from configuration, discovering binaries that are not configured.
    pub fn from_config(config: &StatekeeperConfig) -> StatekeeperResult<Self> {
        let read = config.read_timeout();
        let mutation = config.mutation_timeout();
        let zfs = match config.zfs_binary_path() {
            Some(path) => CommandRunner::with_path(path, read, mutation)?,
            None => discover("zfs", DEFAULT_ZFS_PATHS, read, mutation)?,
        };
        let zpool = match config.zpool_binary_path() {
            Some(path) => CommandRunner::with_path(path, read, mutation)?,
            None => discover("zpool", DEFAULT_ZPOOL_PATHS, read, mutation)?,
        };
        Ok(Self {
            zfs,
            zpool,
            encryption: config.encryption.clone(),
        })
    }


    pub fn with_paths(
        zfs_path: PathBuf,
        zpool_path: PathBuf,
        read_timeout: Duration,
        mutation_timeout: Duration,
    ) -> StatekeeperResult<Self> {
        Ok(Self {
            zfs: CommandRunner::with_path(zfs_path, read_timeout, mutation_timeout)?,
            zpool: CommandRunner::with_path(zpool_path, read_timeout, mutation_timeout)?,
            encryption: EncryptionCfg::default(),
        })
    }

    fn zfs_read(&self, args: &[&str]) -> StatekeeperResult<Output> {
        self.zfs.run_checked(CommandClass::Read, args)
    }

    fn zfs_mutate(&self, args: &[&str]) -> StatekeeperResult<Output> {
        self.zfs.run_checked(CommandClass::Mutation, args)
    }

    fn zpool_read(&self, args: &[&str]) -> StatekeeperResult<Output> {
        self.zpool.run_checked(CommandClass::Read, args)
    }

    fn zpool_mutate(&self, args: &[&str]) -> StatekeeperResult<Output> {
        self.zpool.run_checked(CommandClass::Mutation, args)
    }

    fn dataset_exists(&self, name: &str) -> StatekeeperResult<bool> {
        let out = self
            .zfs
            .run(CommandClass::Read, &["list", "-H", "-o", "name", name])?;
        Ok(out.success() && out.stdout.trim() == name)
    }

    /// True when the parent of `name` exists and is encrypted.
    fn parent_encrypted(&self, name: &str) -> StatekeeperResult<bool> {
        let Some((parent, _)) = name.rsplit_once('/') else {
            return Ok(false);
        };
        let out = self
            .zfs
            .run(CommandClass::Read, &["get", "-H", "-o", "value", "encryption", parent])?;
        Ok(out.success() && !matches!(out.stdout.trim(), "" | "-" | "off"))
    }

    fn key_source(&self, dataset: &DesiredDataset) -> StatekeeperResult<Option<KeySource<'_>>> {
        if !dataset.encrypted {
            return Ok(None);
        }
        if self.parent_encrypted(&dataset.name)? {
            return Ok(Some(KeySource::Inherit));
        }
        let keylocation = self.encryption.keylocation.as_deref().ok_or_else(|| {
            StatekeeperError::Provider(format!(
                "dataset {} would be a new encryption root but encryption.keylocation is not configured",
                dataset.name
            ))
        })?;
        Ok(Some(KeySource::NewRoot {
            algorithm: &self.encryption.algorithm,
            keyformat: &self.encryption.keyformat,
            keylocation,
        }))
    }
}

fn discover(
    label: &str,
    candidates: &[&str],
    read: Duration,
    mutation: Duration,
) -> StatekeeperResult<CommandRunner> {
    CommandRunner::discover(candidates, read, mutation).ok_or_else(|| {
        StatekeeperError::InvalidConfig(format!(
            "unable to locate {label} binary; tried {candidates:?}"
        ))
    })
}

/// `zpool create` arguments: `[-o ashift=N] [-O k=v]... name [vdev] disks...`.
pub(crate) fn create_pool_args(pool: &DesiredPool) -> Vec<String> {
    let mut args = vec!["create".to_string()];
    if pool.ashift > 0 {
        args.push("-o".into());
        args.push(format!("ashift={}", pool.ashift));
    }
    for (key, value) in &pool.options {
        args.push("-O".into());
        args.push(format!("{key}={value}"));
    }
    args.push(pool.name.clone());
    if !pool.vdev_type.is_empty() {
        args.push(pool.vdev_type.clone());
    }
    args.extend(pool.disks.iter().cloned());
    args
}

/// `zfs create -p` arguments with every declared property as `-o k=v`.
pub(crate) fn create_dataset_args(dataset: &DesiredDataset, key: Option<KeySource<'_>>) -> Vec<String> {
    let mut args = vec!["create".to_string(), "-p".to_string()];
    let mut option = |key: &str, value: &str| {
        args.push("-o".into());
        args.push(format!("{key}={value}"));
    };
    if let Some(value) = &dataset.compression {
        option("compression", value.as_str());
    }
    if let Some(value) = &dataset.atime {
        option("atime", value.as_str());
    }
    if let Some(value) = &dataset.mountpoint {
        option("mountpoint", value.as_str());
    }
    if let Some(value) = &dataset.quota {
        option("quota", value.as_str());
    }
    if let Some(KeySource::NewRoot {
        algorithm,
        keyformat,
        keylocation,
    }) = key
    {
        option("encryption", algorithm);
        option("keyformat", keyformat);
        option("keylocation", keylocation);
    }
    for (key, value) in &dataset.properties {
        option(key.as_str(), value.as_str());
    }
    args.push(dataset.name.clone());
    args
}

fn as_strs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

impl ZfsProvider for SystemZfsProvider {
    fn list_pools(&self) -> StatekeeperResult<Vec<LivePool>> {
        let listed = self.zpool_read(&["list", "-H", "-o", "name,health"])?;
        let pairs = parse_tabular_pairs(&listed.stdout);
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let status = self.zpool_read(&["status", "-P"])?;
        let mut disks = parse_pool_disks(&status.stdout);
        Ok(pairs
            .into_iter()
            .map(|(name, health)| LivePool {
                disks: disks.remove(&name).unwrap_or_default(),
                name,
                health,
            })
            .collect())
    }

    fn list_datasets(&self) -> StatekeeperResult<Vec<LiveDataset>> {
        let listed = self.zfs_read(&["list", "-H", "-t", "filesystem", "-o", "name"])?;
        let names: Vec<String> = listed
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let props = self.zfs_read(&[
            "get", "-H", "-p", "-t", "filesystem", "-o", "name,property,value", LIVE_PROPERTIES,
        ])?;
        let mut props = group_properties(parse_property_rows(&props.stdout));
        let local = self.zfs_read(&[
            "get", "-H", "-p", "-t", "filesystem", "-o", "name,property,value", "-s",
            "local,received", "all",
        ])?;
        let mut local = group_properties(parse_property_rows(&local.stdout));
        let snapshots = self.zfs_read(&["list", "-H", "-t", "snapshot", "-o", "name"])?;
        let snapshots = count_snapshots(&snapshots.stdout);

        let mut datasets = Vec::with_capacity(names.len());
        for name in names {
            let mut pm = props.remove(&name).unwrap_or_default();
            let mut take = |key: &str| pm.remove(key).unwrap_or_default();
            let numeric = |key: &str, raw: String| {
                parse_bytes(&raw).ok_or_else(|| {
                    StatekeeperError::Provider(format!(
                        "unparseable {key} value {raw:?} for dataset {name}"
                    ))
                })
            };
            let used = numeric("used", take("used"))?;
            let available = numeric("available", take("available"))?;
            let quota = numeric("quota", take("quota"))?;
            let encryption = take("encryption");
            let dataset = LiveDataset {
                used,
                available,
                quota,
                compression: take("compression"),
                atime: take("atime"),
                mountpoint: take("mountpoint"),
                encrypted: !matches!(encryption.as_str(), "" | "-" | "off"),
                child_count: 0,
                snapshot_count: snapshots.get(&name).copied().unwrap_or(0),
                properties: local.remove(&name).unwrap_or_default(),
                name,
            };
            datasets.push(dataset);
        }
        debug!("read {} dataset(s) from zfs", datasets.len());
        Ok(datasets)
    }

    fn create_pool(&self, pool: &DesiredPool) -> StatekeeperResult<()> {
        if let Some(disk) = pool.disks.iter().find(|d| !d.starts_with(BY_ID_PREFIX)) {
            return Err(StatekeeperError::Provider(format!(
                "refusing to create pool {}: disk {disk} is not a {BY_ID_PREFIX} path",
                pool.name
            )));
        }
        let args = create_pool_args(pool);
        self.zpool_mutate(&as_strs(&args))?;
        info!("created pool {}", pool.name);
        Ok(())
    }

    fn add_pool_disk(&self, pool: &str, disk: &str) -> StatekeeperResult<()> {
        if !disk.starts_with(BY_ID_PREFIX) {
            return Err(StatekeeperError::Provider(format!(
                "cannot add disk {disk} to {pool}: not a {BY_ID_PREFIX} path"
            )));
        }
        self.zpool_mutate(&["add", pool, disk])?;
        info!("added disk {disk} to pool {pool}");
        Ok(())
    }

    fn remove_pool_disk(&self, pool: &str, disk: &str) -> StatekeeperResult<()> {
        self.zpool_mutate(&["remove", pool, disk])?;
        info!("removed disk {disk} from pool {pool}");
        Ok(())
    }

    fn destroy_pool(&self, pool: &str) -> StatekeeperResult<()> {
        self.zpool_mutate(&["destroy", pool])?;
        info!("destroyed pool {pool}");
        Ok(())
    }

    fn create_dataset(&self, dataset: &DesiredDataset) -> StatekeeperResult<()> {
        if self.dataset_exists(&dataset.name)? {
            info!("dataset {} already exists; skipping create", dataset.name);
            return Ok(());
        }
        let key = self.key_source(dataset)?;
        let args = create_dataset_args(dataset, key);
        self.zfs_mutate(&as_strs(&args))?;
        info!("created dataset {}", dataset.name);
        Ok(())
    }

    fn set_dataset_property(
        &self,
        dataset: &str,
        property: &str,
        value: &str,
    ) -> StatekeeperResult<()> {
        let assignment = format!("{property}={value}");
        self.zfs_mutate(&["set", &assignment, dataset])?;
        info!("set {assignment} on {dataset}");
        Ok(())
    }

    fn destroy_dataset(&self, dataset: &str, recursive: bool) -> StatekeeperResult<()> {
        if recursive {
            self.zfs_mutate(&["destroy", "-r", dataset])?;
        } else {
            self.zfs_mutate(&["destroy", dataset])?;
        }
        info!("destroyed dataset {dataset} (recursive={recursive})");
        Ok(())
    }

    fn dataset_used_bytes(&self, dataset: &str) -> StatekeeperResult<u64> {
        let out = self.zfs_read(&["get", "-H", "-p", "-o", "value", "used", dataset])?;
        let raw = out.stdout.trim();
        raw.parse().map_err(|_| {
            StatekeeperError::Provider(format!("unparseable used value {raw:?} for {dataset}"))
        })
    }
}
