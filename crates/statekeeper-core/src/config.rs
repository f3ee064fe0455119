use crate::error::{StatekeeperError, StatekeeperResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/statekeeper.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCfg {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/etc/statekeeper/state.yaml")
}

impl Default for StateCfg {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

impl Default for DriftCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseCfg {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/statekeeper/statekeeper.db")
}

impl Default for DatabaseCfg {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsCfg {
    #[serde(default)]
    pub zfs_path: Option<String>,

    #[serde(default)]
    pub zpool_path: Option<String>,

    #[serde(default)]
    pub smbstatus_path: Option<String>,

    #[serde(default)]
    pub smbcontrol_path: Option<String>,

    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_mutation_timeout_secs")]
    pub mutation_timeout_secs: u64,
}

fn default_read_timeout_secs() -> u64 {
    15
}

fn default_mutation_timeout_secs() -> u64 {
    300
}

impl Default for CommandsCfg {
    fn default() -> Self {
        Self {
            zfs_path: None,
            zpool_path: None,
            smbstatus_path: None,
            smbcontrol_path: None,
            read_timeout_secs: default_read_timeout_secs(),
            mutation_timeout_secs: default_mutation_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SambaCfg {
    #[serde(default = "default_smb_conf_path")]
    pub conf_path: PathBuf,

    #[serde(default = "default_workgroup")]
    pub workgroup: String,

    #[serde(default = "default_server_string")]
    pub server_string: String,
}

fn default_smb_conf_path() -> PathBuf {
    PathBuf::from("/etc/samba/smb.conf")
}

fn default_workgroup() -> String {
    "WORKGROUP".to_string()
}

fn default_server_string() -> String {
    "statekeeper NAS".to_string()
}

impl Default for SambaCfg {
    fn default() -> Self {
        Self {
            conf_path: default_smb_conf_path(),
            workgroup: default_workgroup(),
            server_string: default_server_string(),
        }
    }
}

/// Key settings for declared-encrypted datasets that become their own
/// encryption root. Children of an encrypted parent inherit its key instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionCfg {
    #[serde(default = "default_encryption_algorithm")]
    pub algorithm: String,

    #[serde(default = "default_keyformat")]
    pub keyformat: String,

    /// `file:///...` URI of the key; required to create a new encryption root.
    #[serde(default)]
    pub keylocation: Option<String>,
}

pub const ENCRYPTION_ALGORITHMS: &[&str] = &[
    "aes-128-ccm",
    "aes-192-ccm",
    "aes-256-ccm",
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
];

fn default_encryption_algorithm() -> String {
    "aes-256-gcm".to_string()
}

fn default_keyformat() -> String {
    "raw".to_string()
}

impl Default for EncryptionCfg {
    fn default() -> Self {
        Self {
            algorithm: default_encryption_algorithm(),
            keyformat: default_keyformat(),
            keylocation: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCfg {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8788".to_string()
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// On-disk format the configuration was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatekeeperConfig {
    #[serde(default)]
    pub state: StateCfg,

    #[serde(default)]
    pub drift: DriftCfg,

    #[serde(default)]
    pub database: DatabaseCfg,

    #[serde(default)]
    pub commands: CommandsCfg,

    #[serde(default)]
    pub samba: SambaCfg,

    #[serde(default)]
    pub encryption: EncryptionCfg,

    #[serde(default)]
    pub http: HttpCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

impl StatekeeperConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> StatekeeperResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> StatekeeperResult<()> {
        if !self.state.path.is_absolute() {
            return Err(StatekeeperError::InvalidConfig(format!(
                "state.path must be absolute (got {})",
                self.state.path.display()
            )));
        }
        if self.drift.interval_secs == 0 {
            return Err(StatekeeperError::InvalidConfig(
                "drift.interval_secs must be greater than zero".to_string(),
            ));
        }
        if !ENCRYPTION_ALGORITHMS.contains(&self.encryption.algorithm.as_str()) {
            return Err(StatekeeperError::InvalidConfig(format!(
                "encryption.algorithm {:?} is not one of {ENCRYPTION_ALGORITHMS:?}",
                self.encryption.algorithm
            )));
        }
        if !matches!(self.encryption.keyformat.as_str(), "raw" | "hex" | "passphrase") {
            return Err(StatekeeperError::InvalidConfig(format!(
                "encryption.keyformat must be raw, hex or passphrase (got {:?})",
                self.encryption.keyformat
            )));
        }
        if let Some(location) = &self.encryption.keylocation {
            if !location.starts_with("file:///") {
                return Err(StatekeeperError::InvalidConfig(format!(
                    "encryption.keylocation must be a file:/// URI; prompts cannot be answered unattended (got {location:?})"
                )));
            }
        }
        if self.commands.mutation_timeout_secs < self.commands.read_timeout_secs {
            return Err(StatekeeperError::InvalidConfig(format!(
                "commands.mutation_timeout_secs ({}) must not be shorter than commands.read_timeout_secs ({})",
                self.commands.mutation_timeout_secs, self.commands.read_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn drift_interval(&self) -> Duration {
        Duration::from_secs(self.drift.interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.commands.read_timeout_secs)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_secs(self.commands.mutation_timeout_secs)
    }

    pub fn zfs_binary_path(&self) -> Option<PathBuf> {
        self.commands.zfs_path.as_ref().map(PathBuf::from)
    }

    pub fn zpool_binary_path(&self) -> Option<PathBuf> {
        self.commands.zpool_path.as_ref().map(PathBuf::from)
    }

    pub fn smbstatus_binary_path(&self) -> Option<PathBuf> {
        self.commands.smbstatus_path.as_ref().map(PathBuf::from)
    }

    pub fn smbcontrol_binary_path(&self) -> Option<PathBuf> {
        self.commands.smbcontrol_path.as_ref().map(PathBuf::from)
    }
}
