//! Samba-backed `ShareProvider`.
//!
//! Shares live in the `smb_shares` SQLite table; `smb.conf` is rendered from
//! the enabled rows and the running `smbd` is asked to reload it. Connection
//! counts come from `smbstatus`.

use crate::command::{CommandClass, CommandRunner};
use crate::parse::parse_share_connections;
use log::{debug, info, warn};
use rusqlite::{params, Connection};
use statekeeper_core::config::StatekeeperConfig;
use statekeeper_core::error::{StatekeeperError, StatekeeperResult};
use statekeeper_core::live::LiveShare;
use statekeeper_core::provider::ShareProvider;
use statekeeper_core::state::DesiredShare;
use statekeeper_core::statefile::write_atomic;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub const DEFAULT_SMBSTATUS_PATHS: &[&str] = &["/usr/bin/smbstatus", "/usr/local/bin/smbstatus"];

pub const DEFAULT_SMBCONTROL_PATHS: &[&str] =
    &["/usr/bin/smbcontrol", "/usr/local/bin/smbcontrol"];

/// `[global]` values and the location of the rendered configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SambaSettings {
    pub conf_path: PathBuf,
    pub workgroup: String,
    pub server_string: String,
}

impl SambaSettings {
    pub fn from_config(config: &StatekeeperConfig) -> Self {
        Self {
            conf_path: config.samba.conf_path.clone(),
            workgroup: config.samba.workgroup.clone(),
            server_string: config.samba.server_string.clone(),
        }
    }
}

pub struct SambaShareProvider {
    conn: Mutex<Connection>,
    settings: SambaSettings,
    smbstatus: Option<CommandRunner>,
    smbcontrol: Option<CommandRunner>,
}

impl SambaShareProvider {
    /// Open the share registry in the configured database and locate the
    /// Samba tools. Missing tools are tolerated: without `smbstatus` every
    /// share reports zero connections, without `smbcontrol` reloads only
    /// rewrite the file.
    pub fn from_config(config: &StatekeeperConfig) -> StatekeeperResult<Self> {
        let path = &config.database.path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let read = config.read_timeout();
        let mutation = config.mutation_timeout();
        let smbstatus = locate(config.smbstatus_binary_path(), DEFAULT_SMBSTATUS_PATHS, read, mutation)?;
        let smbcontrol =
            locate(config.smbcontrol_binary_path(), DEFAULT_SMBCONTROL_PATHS, read, mutation)?;
        if smbstatus.is_none() {
            warn!("smbstatus not found; share connection counts will read as zero");
        }

        Self::new(
            Connection::open(path)?,
            SambaSettings::from_config(config),
            smbstatus,
            smbcontrol,
        )
    }

    pub fn new(
        conn: Connection,
        settings: SambaSettings,
        smbstatus: Option<CommandRunner>,
        smbcontrol: Option<CommandRunner>,
    ) -> StatekeeperResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS smb_shares (
                name TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                read_only INTEGER NOT NULL DEFAULT 0,
                valid_users TEXT NOT NULL DEFAULT '',
                comment TEXT NOT NULL DEFAULT '',
                guest_ok INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            settings,
            smbstatus,
            smbcontrol,
        })
    }

    pub fn settings(&self) -> &SambaSettings {
        &self.settings
    }

    fn enabled_shares(&self) -> StatekeeperResult<Vec<LiveShare>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT name, path, read_only, valid_users, comment, guest_ok
             FROM smb_shares WHERE enabled = 1 ORDER BY name",
        )?;
        let shares = stmt
            .query_map([], |row| {
                Ok(LiveShare {
                    name: row.get(0)?,
                    path: row.get(1)?,
                    read_only: row.get(2)?,
                    valid_users: row.get(3)?,
                    comment: row.get(4)?,
                    guest_ok: row.get(5)?,
                    active_connections: 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(shares)
    }

    fn connection_counts(&self) -> StatekeeperResult<HashMap<String, u32>> {
        let Some(runner) = &self.smbstatus else {
            return Ok(HashMap::new());
        };
        let out = runner.run_checked(CommandClass::Read, &["-S", "-n"])?;
        Ok(parse_share_connections(&out.stdout))
    }
}

fn locate(
    configured: Option<PathBuf>,
    candidates: &[&str],
    read: Duration,
    mutation: Duration,
) -> StatekeeperResult<Option<CommandRunner>> {
    match configured {
        Some(path) => CommandRunner::with_path(path, read, mutation).map(Some),
        None => Ok(CommandRunner::discover(candidates, read, mutation)),
    }
}

/// Render a complete `smb.conf` for `shares`.
pub fn render_smb_conf(settings: &SambaSettings, shares: &[LiveShare]) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "[global]\n   workgroup = {}\n   server string = {}\n\n",
        settings.workgroup, settings.server_string
    );
    for share in shares {
        let _ = write!(out, "[{}]\n   path = {}\n", share.name, share.path);
        if share.read_only {
            out.push_str("   read only = yes\n");
        }
        if !share.valid_users.is_empty() {
            let _ = writeln!(out, "   valid users = {}", share.valid_users);
        }
        if !share.comment.is_empty() {
            let _ = writeln!(out, "   comment = {}", share.comment);
        }
        if share.guest_ok {
            out.push_str("   guest ok = yes\n");
        }
        out.push('\n');
    }
    out
}

fn write_conf(path: &Path, contents: &str) -> StatekeeperResult<()> {
    write_atomic(path, contents.as_bytes()).map_err(|err| {
        StatekeeperError::Provider(format!("writing {}: {err}", path.display()))
    })
}

impl ShareProvider for SambaShareProvider {
    fn list_shares(&self) -> StatekeeperResult<Vec<LiveShare>> {
        let mut shares = self.enabled_shares()?;
        let counts = self.connection_counts()?;
        for share in &mut shares {
            share.active_connections = counts.get(&share.name).copied().unwrap_or(0);
        }
        Ok(shares)
    }

    fn upsert_share(&self, share: &DesiredShare) -> StatekeeperResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO smb_shares (name, path, read_only, valid_users, comment, guest_ok, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, datetime('now'))
             ON CONFLICT(name) DO UPDATE SET
                path = excluded.path,
                read_only = excluded.read_only,
                valid_users = excluded.valid_users,
                comment = excluded.comment,
                guest_ok = excluded.guest_ok,
                enabled = 1,
                updated_at = excluded.updated_at",
            params![
                share.name,
                share.path,
                share.read_only,
                share.valid_users,
                share.comment,
                share.guest_ok
            ],
        )?;
        info!("share {} registered at {}", share.name, share.path);
        Ok(())
    }

    fn remove_share(&self, name: &str) -> StatekeeperResult<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = conn.execute("DELETE FROM smb_shares WHERE name = ?1", params![name])?;
        if removed == 0 {
            debug!("share {name} was not registered");
        } else {
            info!("share {name} removed");
        }
        Ok(())
    }

    fn reload(&self) -> StatekeeperResult<()> {
        let shares = self.enabled_shares()?;
        write_conf(&self.settings.conf_path, &render_smb_conf(&self.settings, &shares))?;
        info!(
            "rendered {} share(s) to {}",
            shares.len(),
            self.settings.conf_path.display()
        );

        let Some(runner) = &self.smbcontrol else {
            warn!("smbcontrol not found; smbd was not asked to reload");
            return Ok(());
        };
        match runner.run(CommandClass::Read, &["smbd", "reload-config"]) {
            Ok(out) if out.success() => debug!("smbd reloaded its configuration"),
            Ok(out) => warn!(
                "smbcontrol reload failed (exit {}): {}",
                out.status,
                out.diagnostic()
            ),
            Err(err) => warn!("smbcontrol reload failed: {err}"),
        }
        Ok(())
    }

    fn active_connections(&self, name: &str) -> StatekeeperResult<u32> {
        Ok(self.connection_counts()?.get(name).copied().unwrap_or(0))
    }
}
