//! Host adapters for the statekeeper engine: the `zfs`/`zpool` command
//! surface and the Samba share registry. `command` and `parse` cover the
//! shell integration details.

mod command;
mod parse;
mod samba;
mod system;

pub use command::{CommandClass, CommandRunner, Output};
pub use samba::{
    render_smb_conf, SambaSettings, SambaShareProvider, DEFAULT_SMBCONTROL_PATHS,
    DEFAULT_SMBSTATUS_PATHS,
};
pub use system::{SystemZfsProvider, DEFAULT_ZFS_PATHS, DEFAULT_ZPOOL_PATHS};
