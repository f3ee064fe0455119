//! Desired-state document: types, parsing and validation.
//!
//! The document is YAML. Parsing is all-or-nothing: the first violation is
//! returned with the path of the offending field and no partial state escapes.

use crate::error::{StatekeeperError, StatekeeperResult};
use crate::units::parse_size;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// The only schema version this build understands.
pub const SUPPORTED_VERSION: &str = "1";

/// Prefix every declared pool disk must carry.
pub const BY_ID_PREFIX: &str = "/dev/disk/by-id/";

const VDEV_TYPES: &[&str] = &["", "mirror", "raidz", "raidz1", "raidz2", "raidz3"];
const COMPRESSION_VALUES: &[&str] = &["lz4", "zstd", "gzip", "off", "on"];
const ATIME_VALUES: &[&str] = &["on", "off"];
const DISK_ILLEGAL_CHARS: &[char] = &[';', '|', '&', '$', '`', '\\', '"', '\'', ' ', '\t', '\n'];

/// Properties with a dedicated field; they may not appear under `properties`.
const MANAGED_DATASET_FIELDS: &[&str] = &["compression", "atime", "mountpoint", "quota"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DesiredState {
    /// Schema version; must be "1".
    #[serde(deserialize_with = "version_string")]
    #[schemars(with = "String")]
    pub version: String,

    #[serde(default)]
    pub pools: Vec<DesiredPool>,

    #[serde(default)]
    pub datasets: Vec<DesiredDataset>,

    #[serde(default)]
    pub shares: Vec<DesiredShare>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DesiredPool {
    pub name: String,

    /// One of "", mirror, raidz, raidz1, raidz2, raidz3. Empty means stripe.
    #[serde(default)]
    pub vdev_type: String,

    /// Member disks as `/dev/disk/by-id/...` paths.
    #[serde(default)]
    pub disks: Vec<String>,

    /// 0 lets ZFS pick; otherwise 9 through 16.
    #[serde(default)]
    pub ashift: u32,

    /// Root dataset properties applied at creation (`zpool create -O`).
    #[serde(default, deserialize_with = "scalar_map")]
    #[schemars(with = "BTreeMap<String, String>")]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DesiredDataset {
    /// Fully qualified name, e.g. `tank/media`.
    pub name: String,

    /// `2T`, `500G`, raw bytes or `none`.
    #[serde(
        default,
        deserialize_with = "optional_scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<String>")]
    pub quota: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,

    /// Creation-time only; encryption cannot be toggled on a live dataset.
    #[serde(default)]
    pub encrypted: bool,

    /// Any other ZFS property to hold at a local value.
    #[serde(
        default,
        deserialize_with = "scalar_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    #[schemars(with = "BTreeMap<String, String>")]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DesiredShare {
    pub name: String,

    pub path: String,

    #[serde(default)]
    pub read_only: bool,

    /// Samba `valid users` line, e.g. `@media_users alice`.
    #[serde(default)]
    pub valid_users: String,

    #[serde(default)]
    pub comment: String,

    #[serde(default)]
    pub guest_ok: bool,
}

impl DesiredState {
    /// Parse and validate a desired-state document.
    pub fn parse(content: &str) -> StatekeeperResult<Self> {
        let state: DesiredState = serde_yaml::from_str(content)
            .map_err(|err| StatekeeperError::StateSyntax(err.to_string()))?;
        state.validate()?;
        Ok(state)
    }

    /// Read `path` and parse it.
    pub fn load<P: AsRef<Path>>(path: P) -> StatekeeperResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StatekeeperError::StateNotFound(path.to_path_buf())
            } else {
                StatekeeperError::Io(err)
            }
        })?;
        Self::parse(&content)
    }

    /// Check every rule, stopping at the first violation.
    pub fn validate(&self) -> StatekeeperResult<()> {
        if self.version != SUPPORTED_VERSION {
            return Err(StatekeeperError::validation(
                "version",
                format!(
                    "unsupported version {:?} (only {:?} is supported)",
                    self.version, SUPPORTED_VERSION
                ),
            ));
        }

        let mut seen = HashSet::new();
        for (idx, pool) in self.pools.iter().enumerate() {
            validate_pool(idx, pool)?;
            if !seen.insert(pool.name.as_str()) {
                return Err(duplicate("pools", idx, &pool.name));
            }
        }

        let mut seen = HashSet::new();
        for (idx, dataset) in self.datasets.iter().enumerate() {
            validate_dataset(idx, dataset)?;
            if !seen.insert(dataset.name.as_str()) {
                return Err(duplicate("datasets", idx, &dataset.name));
            }
        }

        let mut seen = HashSet::new();
        for (idx, share) in self.shares.iter().enumerate() {
            validate_share(idx, share)?;
            if !seen.insert(share.name.as_str()) {
                return Err(duplicate("shares", idx, &share.name));
            }
        }

        Ok(())
    }

    /// One-line description used by the CLI and log lines.
    pub fn summary(&self) -> String {
        format!(
            "{} pool(s), {} dataset(s), {} share(s)",
            self.pools.len(),
            self.datasets.len(),
            self.shares.len()
        )
    }
}

fn duplicate(section: &str, idx: usize, name: &str) -> StatekeeperError {
    StatekeeperError::validation(
        format!("{section}[{idx}].name"),
        format!("duplicate name {name:?}"),
    )
}

/// `[a-zA-Z0-9][a-zA-Z0-9_.-]*`, with `/` also allowed for dataset names.
fn is_valid_name(name: &str, allow_slash: bool) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && chars.all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') || (allow_slash && c == '/')
        })
}

fn is_valid_property_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | ':'))
}

fn validate_pool(idx: usize, pool: &DesiredPool) -> StatekeeperResult<()> {
    let at = |field: &str| format!("pools[{idx}].{field}");

    if pool.name.is_empty() {
        return Err(StatekeeperError::validation(at("name"), "name must not be empty"));
    }
    if !is_valid_name(&pool.name, false) {
        return Err(StatekeeperError::validation(
            at("name"),
            format!("invalid pool name {:?}", pool.name),
        ));
    }
    if !VDEV_TYPES.contains(&pool.vdev_type.as_str()) {
        return Err(StatekeeperError::validation(
            at("vdev_type"),
            format!(
                "unknown vdev_type {:?} (expected one of mirror, raidz, raidz1, raidz2, raidz3 or empty for stripe)",
                pool.vdev_type
            ),
        ));
    }
    if pool.disks.is_empty() {
        return Err(StatekeeperError::validation(at("disks"), "disks list is empty"));
    }
    let mut seen = HashSet::new();
    for (disk_idx, disk) in pool.disks.iter().enumerate() {
        let field = format!("pools[{idx}].disks[{disk_idx}]");
        if !disk.starts_with(BY_ID_PREFIX) || disk.len() == BY_ID_PREFIX.len() {
            return Err(StatekeeperError::validation(
                field,
                format!(
                    "disk {disk:?} must be a {BY_ID_PREFIX} path; kernel names such as /dev/sdX change across reboots"
                ),
            ));
        }
        if disk.contains(DISK_ILLEGAL_CHARS) {
            return Err(StatekeeperError::validation(
                field,
                format!("disk {disk:?} contains illegal characters"),
            ));
        }
        if !seen.insert(disk.as_str()) {
            return Err(StatekeeperError::validation(
                field,
                format!("disk {disk:?} is listed twice"),
            ));
        }
    }
    if pool.ashift != 0 && !(9..=16).contains(&pool.ashift) {
        return Err(StatekeeperError::validation(
            at("ashift"),
            format!("ashift {} out of range [9,16]", pool.ashift),
        ));
    }
    for (key, value) in &pool.options {
        validate_property(&format!("pools[{idx}].options.{key}"), key, value)?;
    }
    Ok(())
}

fn validate_dataset(idx: usize, dataset: &DesiredDataset) -> StatekeeperResult<()> {
    let at = |field: &str| format!("datasets[{idx}].{field}");

    if dataset.name.is_empty() {
        return Err(StatekeeperError::validation(at("name"), "name must not be empty"));
    }
    if !is_valid_name(&dataset.name, true) || dataset.name.split('/').any(str::is_empty) {
        return Err(StatekeeperError::validation(
            at("name"),
            format!("invalid dataset name {:?}", dataset.name),
        ));
    }
    if let Some(quota) = &dataset.quota {
        if parse_size(quota).is_none() {
            return Err(StatekeeperError::validation(
                at("quota"),
                format!("cannot interpret quota {quota:?} (use e.g. 2T, 500G, raw bytes or none)"),
            ));
        }
    }
    if let Some(compression) = &dataset.compression {
        if !COMPRESSION_VALUES.contains(&compression.as_str()) {
            return Err(StatekeeperError::validation(
                at("compression"),
                format!("unknown compression {compression:?}"),
            ));
        }
    }
    if let Some(atime) = &dataset.atime {
        if !ATIME_VALUES.contains(&atime.as_str()) {
            return Err(StatekeeperError::validation(
                at("atime"),
                format!("atime must be \"on\" or \"off\" (got {atime:?})"),
            ));
        }
    }
    if let Some(mountpoint) = &dataset.mountpoint {
        if !mountpoint.starts_with('/') {
            return Err(StatekeeperError::validation(
                at("mountpoint"),
                format!("mountpoint {mountpoint:?} must be an absolute path"),
            ));
        }
    }
    for (key, value) in &dataset.properties {
        let field = format!("datasets[{idx}].properties.{key}");
        if MANAGED_DATASET_FIELDS.contains(&key.as_str()) {
            return Err(StatekeeperError::validation(
                field,
                format!("{key} has a dedicated field; set it there instead"),
            ));
        }
        validate_property(&field, key, value)?;
    }
    Ok(())
}

fn validate_property(field: &str, key: &str, value: &str) -> StatekeeperResult<()> {
    if !is_valid_property_name(key) {
        return Err(StatekeeperError::validation(
            field,
            format!("invalid property name {key:?}"),
        ));
    }
    if value.is_empty() || value.chars().any(char::is_control) {
        return Err(StatekeeperError::validation(
            field,
            format!("invalid value {value:?} for property {key}"),
        ));
    }
    Ok(())
}

fn validate_share(idx: usize, share: &DesiredShare) -> StatekeeperResult<()> {
    let at = |field: &str| format!("shares[{idx}].{field}");

    if share.name.is_empty() {
        return Err(StatekeeperError::validation(at("name"), "name must not be empty"));
    }
    if !is_valid_name(&share.name, false) {
        return Err(StatekeeperError::validation(
            at("name"),
            format!("invalid share name {:?}", share.name),
        ));
    }
    if share.path.is_empty() || !share.path.starts_with('/') {
        return Err(StatekeeperError::validation(
            at("path"),
            "path must be a non-empty absolute path",
        ));
    }
    for (field, value) in [
        ("path", &share.path),
        ("valid_users", &share.valid_users),
        ("comment", &share.comment),
    ] {
        if value.chars().any(char::is_control) {
            return Err(StatekeeperError::validation(
                at(field),
                "control characters are not allowed",
            ));
        }
    }
    Ok(())
}

/// Scalars arrive from YAML as strings, integers, floats or booleans.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Text(text) => text,
            Scalar::Int(value) => value.to_string(),
            Scalar::Float(value) => value.to_string(),
            Scalar::Bool(value) => if value { "on" } else { "off" }.to_string(),
        }
    }
}

/// Integers are taken as written; a float keeps its decimal point so `1.0`
/// fails the version check instead of passing as "1".
fn version_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Scalar::deserialize(deserializer).map(|value| match value {
        Scalar::Float(value) => format!("{value:?}"),
        other => other.into_string(),
    })
}

fn optional_scalar_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Option::<Scalar>::deserialize(deserializer).map(|value| value.map(Scalar::into_string))
}

fn scalar_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    let raw = Option::<BTreeMap<String, Scalar>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (key, value.into_string()))
        .collect())
}

/// JSON schema describing the desired-state document.
pub fn json_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(DesiredState)
}

/// Annotated starter document served when no state file exists yet.
pub fn default_template() -> &'static str {
    TEMPLATE
}

const TEMPLATE: &str = r#"# statekeeper desired state
#
# Declare the pools, datasets and SMB shares this node should have. Every plan
# compares this file against the live system; destructive changes are held as
# BLOCKED until an operator approves them.
version: "1"

# Pool disks must use /dev/disk/by-id/ paths. /dev/sdX names are rejected.
#
# pools:
#   - name: tank
#     vdev_type: mirror          # "", mirror, raidz, raidz1, raidz2, raidz3
#     disks:
#       - /dev/disk/by-id/ata-EXAMPLE_SERIAL_1
#       - /dev/disk/by-id/ata-EXAMPLE_SERIAL_2
#     ashift: 12                 # 0 = auto, otherwise 9-16
#     options:
#       compression: lz4
pools: []

# datasets:
#   - name: tank/media
#     quota: 8T
#     compression: lz4
#     atime: "off"
#     mountpoint: /mnt/media
#     properties:
#       recordsize: 1M
datasets: []

# shares:
#   - name: media
#     path: /mnt/media
#     read_only: false
#     valid_users: "@media_users"
#     comment: Media library
shares: []
"#;
