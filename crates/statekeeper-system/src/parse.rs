//! Helpers for turning `zfs`, `zpool` and `smbstatus` output into data the
//! providers can reason about.

use statekeeper_core::state::BY_ID_PREFIX;
use std::collections::{BTreeMap, HashMap};

/// Turn `-H -o name,value` style output into name/value pairs.
pub(crate) fn parse_tabular_pairs(output: &str) -> Vec<(String, String)> {
    output.lines().filter_map(parse_pair_line).collect()
}

fn parse_pair_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed == "no pools available" {
        return None;
    }

    if let Some((left, right)) = trimmed.split_once('\t') {
        let name = left.trim();
        if name.is_empty() {
            return None;
        }
        return Some((name.to_string(), right.trim().to_string()));
    }

    let (name, value) = trimmed.split_once(char::is_whitespace)?;
    Some((name.to_string(), value.trim().to_string()))
}

/// One `name<TAB>property<TAB>value` row from `zfs get -H -o name,property,value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PropertyRow {
    pub name: String,
    pub property: String,
    pub value: String,
}

pub(crate) fn parse_property_rows(output: &str) -> Vec<PropertyRow> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                return None;
            }
            let fields: Vec<&str> = if line.contains('\t') {
                line.splitn(3, '\t').collect()
            } else {
                line.splitn(3, char::is_whitespace).collect()
            };
            let mut parts = fields.into_iter();
            let name = parts.next()?.trim();
            let property = parts.next()?.trim();
            let value = parts.next().unwrap_or("").trim();
            if name.is_empty() || property.is_empty() {
                return None;
            }
            Some(PropertyRow {
                name: name.to_string(),
                property: property.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

/// Group property rows per dataset.
pub(crate) fn group_properties(rows: Vec<PropertyRow>) -> HashMap<String, BTreeMap<String, String>> {
    let mut grouped: HashMap<String, BTreeMap<String, String>> = HashMap::new();
    for row in rows {
        grouped.entry(row.name).or_default().insert(row.property, row.value);
    }
    grouped
}

/// Member disks per pool from `zpool status -P`.
///
/// Only devices under `/dev/disk/by-id/` are reported; partition suffixes
/// (`-part1`) are dropped so members compare equal to whole-disk paths.
pub(crate) fn parse_pool_disks(status: &str) -> HashMap<String, Vec<String>> {
    let mut disks: HashMap<String, Vec<String>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in status.lines() {
        let trimmed = line.trim();
        if let Some(pool) = trimmed.strip_prefix("pool:") {
            let pool = pool.trim().to_string();
            disks.entry(pool.clone()).or_default();
            current = Some(pool);
            continue;
        }
        let Some(pool) = current.as_ref() else {
            continue;
        };
        if !trimmed.contains(BY_ID_PREFIX) {
            continue;
        }
        if let Some(device) = trimmed.split_whitespace().next() {
            let device = strip_partition(device).to_string();
            let members = disks.entry(pool.clone()).or_default();
            if !members.contains(&device) {
                members.push(device);
            }
        }
    }
    disks
}

fn strip_partition(device: &str) -> &str {
    match device.rfind("-part") {
        Some(idx)
            if idx + 5 < device.len()
                && device[idx + 5..].chars().all(|c| c.is_ascii_digit()) =>
        {
            &device[..idx]
        }
        _ => device,
    }
}

/// Snapshot counts per dataset from `zfs list -H -t snapshot -o name`.
pub(crate) fn count_snapshots(output: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for line in output.lines() {
        if let Some((dataset, _)) = line.trim().split_once('@') {
            *counts.entry(dataset.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Connected clients per share from `smbstatus -S -n`.
pub(crate) fn parse_share_connections(output: &str) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    let mut in_table = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("---") {
            in_table = true;
            continue;
        }
        if !in_table || trimmed.is_empty() {
            continue;
        }
        if let Some(share) = trimmed.split_whitespace().next() {
            *counts.entry(share.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Parse a `-p` numeric property; `-`, `none` and empty read as zero.
pub(crate) fn parse_bytes(value: &str) -> Option<u64> {
    match value.trim() {
        "" | "-" | "none" => Some(0),
        other => other.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tabular_pairs_handles_tabs_spaces_and_empty_hosts() {
        assert_eq!(
            parse_tabular_pairs("tank\tONLINE\nbackup\tDEGRADED\n"),
            vec![
                ("tank".to_string(), "ONLINE".to_string()),
                ("backup".to_string(), "DEGRADED".to_string())
            ]
        );
        assert_eq!(
            parse_tabular_pairs("tank ONLINE\n"),
            vec![("tank".to_string(), "ONLINE".to_string())]
        );
        assert!(parse_tabular_pairs("no pools available\n").is_empty());
    }

    #[test]
    fn property_rows_keep_values_with_spaces() {
        let rows = parse_property_rows(
            "tank/data\tused\t4096\ntank/data\tmountpoint\t/srv/my data\ntank\tquota\t0\n",
        );
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].value, "/srv/my data");
        let grouped = group_properties(rows);
        assert_eq!(grouped["tank/data"]["used"], "4096");
        assert_eq!(grouped["tank"]["quota"], "0");
    }

    #[test]
    fn pool_disks_come_from_by_id_lines_per_pool() {
        let status = "  pool: tank
 state: ONLINE
config:

\tNAME                                      STATE     READ WRITE CKSUM
\ttank                                      ONLINE       0     0     0
\t  mirror-0                                ONLINE       0     0     0
\t    /dev/disk/by-id/ata-DISK_A-part1      ONLINE       0     0     0
\t    /dev/disk/by-id/ata-DISK_B            ONLINE       0     0     0

errors: No known data errors

  pool: scratch
 state: ONLINE
config:

\tscratch     ONLINE       0     0     0
\t  /dev/sdc1 ONLINE       0     0     0
";
        let disks = parse_pool_disks(status);
        assert_eq!(
            disks["tank"],
            vec![
                "/dev/disk/by-id/ata-DISK_A".to_string(),
                "/dev/disk/by-id/ata-DISK_B".to_string()
            ]
        );
        assert!(disks["scratch"].is_empty());
    }

    #[test]
    fn strip_partition_only_removes_numeric_suffix() {
        assert_eq!(strip_partition("/dev/disk/by-id/wwn-0x5-part12"), "/dev/disk/by-id/wwn-0x5");
        assert_eq!(strip_partition("/dev/disk/by-id/ata-partner"), "/dev/disk/by-id/ata-partner");
        assert_eq!(strip_partition("/dev/disk/by-id/ata-x-part"), "/dev/disk/by-id/ata-x-part");
    }

    #[test]
    fn snapshots_are_counted_per_dataset() {
        let counts = count_snapshots("tank/a@daily-1\ntank/a@daily-2\ntank/b@x\n\n");
        assert_eq!(counts["tank/a"], 2);
        assert_eq!(counts["tank/b"], 1);
        assert!(!counts.contains_key("tank"));
    }

    #[test]
    fn share_connections_skip_the_header() {
        let out = "
Service      pid     Machine       Connected at                     Encryption   Signing
---------------------------------------------------------------------------------------------
media        4021    192.168.1.20  Sat Oct 17 10:01:02 AM 2026 UTC  -            -
media        4188    192.168.1.31  Sat Oct 17 10:07:40 AM 2026 UTC  -            -
backup       4190    192.168.1.31  Sat Oct 17 10:07:41 AM 2026 UTC  -            -
";
        let counts = parse_share_connections(out);
        assert_eq!(counts["media"], 2);
        assert_eq!(counts["backup"], 1);
        assert!(!counts.contains_key("Service"));
    }

    #[test]
    fn parse_bytes_treats_placeholders_as_zero() {
        assert_eq!(parse_bytes("none"), Some(0));
        assert_eq!(parse_bytes("-"), Some(0));
        assert_eq!(parse_bytes("1073741824"), Some(1 << 30));
        assert_eq!(parse_bytes("1G"), None);
    }
}
