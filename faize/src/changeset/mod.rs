//! Per-session change reports.
//!
//! The host cannot see the guest's ephemeral overlay, so visibility comes
//! from two sources: filesystem snapshots of the writable mounts taken on
//! the host before and after the session, and the guest-produced reports
//! (`guest-changes.txt`, `network.log`) published through the bootstrap
//! directory.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FaizeResult;

/// Directories with more direct children than this are summarized, not
/// walked.
const LARGE_DIR_THRESHOLD: usize = 500;

/// One file's metadata at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub mode: u32,
    pub is_dir: bool,
    /// For summarized directories: count of direct children.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub child_count: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Relative path → entry. Ordered for deterministic serialization.
pub type Snapshot = BTreeMap<String, FileEntry>;

/// Walk a directory into a snapshot.
///
/// `.git` contents are skipped (the directory entry itself is recorded).
/// `node_modules` and any directory with more than 500 direct children are
/// recorded with a child count and not descended into.
pub fn take(root: &Path) -> FaizeResult<Snapshot> {
    let mut snap = Snapshot::new();

    let mut walker = walkdir::WalkDir::new(root).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            crate::errors::FaizeError::Session(format!("snapshot walk failed: {e}"))
        })?;
        if entry.path() == root {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        let meta = entry.metadata().map_err(|e| {
            crate::errors::FaizeError::Session(format!("snapshot metadata failed: {e}"))
        })?;

        let mut file_entry = FileEntry {
            path: rel.clone(),
            size: meta.len(),
            mod_time: meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now()),
            mode: meta.permissions().mode(),
            is_dir: meta.is_dir(),
            child_count: 0,
        };

        if meta.is_dir() {
            if entry.file_name() == ".git" {
                snap.insert(rel, file_entry);
                walker.skip_current_dir();
                continue;
            }

            let child_count = fs::read_dir(entry.path()).map(|d| d.count()).unwrap_or(0);
            file_entry.child_count = child_count;

            if entry.file_name() == "node_modules" || child_count > LARGE_DIR_THRESHOLD {
                snap.insert(rel, file_entry);
                walker.skip_current_dir();
                continue;
            }
        }

        snap.insert(rel, file_entry);
    }

    Ok(snap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

/// A single file change between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Relative to the mount root.
    pub path: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_size: Option<u64>,
}

/// Compare two snapshots. Output is sorted by path.
pub fn diff(before: &Snapshot, after: &Snapshot) -> Vec<Change> {
    let mut changes = Vec::new();

    for (path, after_entry) in after {
        match before.get(path) {
            None => changes.push(Change {
                path: path.clone(),
                change_type: ChangeType::Created,
                old_size: None,
                new_size: Some(after_entry.size),
            }),
            Some(before_entry) => {
                if before_entry.size != after_entry.size
                    || before_entry.mod_time != after_entry.mod_time
                {
                    changes.push(Change {
                        path: path.clone(),
                        change_type: ChangeType::Modified,
                        old_size: Some(before_entry.size),
                        new_size: Some(after_entry.size),
                    });
                }
            }
        }
    }

    for (path, before_entry) in before {
        if !after.contains_key(path) {
            changes.push(Change {
                path: path.clone(),
                change_type: ChangeType::Deleted,
                old_size: Some(before_entry.size),
                new_size: None,
            });
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

/// Internal-state prefixes hidden from user-facing change summaries.
const IGNORE_PREFIXES: &[&str] = &[".git", ".omc", ".claude"];

fn matches_ignore_prefix(path: &str) -> bool {
    IGNORE_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{prefix}/")))
}

/// Drop directory entries and internal-state paths from a change list.
/// Directory entries are redundant once child files are listed.
pub fn filter_noise(changes: Vec<Change>, before: &Snapshot, after: &Snapshot) -> Vec<Change> {
    changes
        .into_iter()
        .filter(|c| {
            let is_dir = after
                .get(&c.path)
                .or_else(|| before.get(&c.path))
                .map(|e| e.is_dir)
                .unwrap_or(false);
            !is_dir && !matches_ignore_prefix(&c.path)
        })
        .collect()
}

/// Prefix-only filtering for loaded changesets where snapshots are gone.
pub fn filter_paths(changes: Vec<Change>) -> Vec<Change> {
    changes
        .into_iter()
        .filter(|c| !matches_ignore_prefix(&c.path))
        .collect()
}

/// Changes grouped by mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountChanges {
    /// Host path.
    pub source: PathBuf,
    /// Guest path.
    pub target: String,
    pub changes: Vec<Change>,
}

/// One parsed firewall event from the guest's dmesg collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    /// `CONN` for accepted connections, `DENY` for dropped ones.
    pub action: String,
    pub proto: String,
    pub dst_ip: String,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub dst_port: u16,
    #[serde(default, skip_serializing_if = "is_zero_u16")]
    pub src_port: u16,
}

fn is_zero_u16(n: &u16) -> bool {
    *n == 0
}

/// The complete changeset for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionChangeset {
    pub session_id: String,
    pub mount_changes: Vec<MountChanges>,
    /// Lines from `guest-changes.txt`.
    pub guest_changes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_events: Vec<NetworkEvent>,
}

pub fn save_snapshot(path: &Path, snap: &Snapshot) -> FaizeResult<()> {
    let data = serde_json::to_vec_pretty(snap)?;
    fs::write(path, data)?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> FaizeResult<Snapshot> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn save_changeset(path: &Path, cs: &SessionChangeset) -> FaizeResult<()> {
    let data = serde_json::to_vec_pretty(cs)?;
    fs::write(path, data)?;
    Ok(())
}

pub fn load_changeset(path: &Path) -> FaizeResult<SessionChangeset> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Parse a `network.log` (dmesg lines with `FAIZE_` prefixes) into events.
/// A missing file yields an empty list.
pub fn parse_network_log(path: &Path) -> FaizeResult<Vec<NetworkEvent>> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    // Example: "FAIZE_NET: IN= OUT=eth0 SRC=10.0.2.15 DST=140.82.114.4 ... PROTO=TCP SPT=45678 DPT=443"
    static RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(
            r"FAIZE_(NET|DENY):.*?SRC=(\S+)\s+DST=(\S+).*?PROTO=(\S+)(?:.*?SPT=(\d+))?(?:.*?DPT=(\d+))?",
        )
        .expect("network log pattern compiles")
    });
    let re = &*RE;

    let mut events = Vec::new();
    for line in data.lines() {
        let Some(caps) = re.captures(line) else {
            continue;
        };

        let action = if &caps[1] == "DENY" { "DENY" } else { "CONN" };
        events.push(NetworkEvent {
            action: action.to_string(),
            proto: caps[4].to_string(),
            dst_ip: caps[3].to_string(),
            dst_port: caps
                .get(6)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0),
            src_port: caps
                .get(5)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0),
        });
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_snapshot_skips_git_contents() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: x").unwrap();
        fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();

        let snap = take(dir.path()).unwrap();
        assert!(snap.contains_key(".git"));
        assert!(!snap.contains_key(".git/HEAD"));
        assert!(snap.contains_key("main.rs"));
    }

    #[test]
    fn test_snapshot_summarizes_node_modules() {
        let dir = tempdir().unwrap();
        let nm = dir.path().join("node_modules");
        fs::create_dir(&nm).unwrap();
        fs::create_dir(nm.join("left-pad")).unwrap();
        fs::create_dir(nm.join("lodash")).unwrap();

        let snap = take(dir.path()).unwrap();
        let entry = snap.get("node_modules").unwrap();
        assert!(entry.is_dir);
        assert_eq!(entry.child_count, 2);
        assert!(!snap.contains_key("node_modules/left-pad"));
    }

    #[test]
    fn test_diff_detects_all_change_kinds() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("kept.txt"), "same").unwrap();
        fs::write(dir.path().join("gone.txt"), "bye").unwrap();
        fs::write(dir.path().join("grows.txt"), "v1").unwrap();
        let before = take(dir.path()).unwrap();

        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        fs::write(dir.path().join("grows.txt"), "version2").unwrap();
        fs::write(dir.path().join("fresh.txt"), "new").unwrap();
        let after = take(dir.path()).unwrap();

        let changes = diff(&before, &after);
        let by_path: BTreeMap<_, _> = changes.iter().map(|c| (c.path.as_str(), c)).collect();

        assert_eq!(by_path["fresh.txt"].change_type, ChangeType::Created);
        assert_eq!(by_path["gone.txt"].change_type, ChangeType::Deleted);
        assert_eq!(by_path["grows.txt"].change_type, ChangeType::Modified);
        assert_eq!(by_path["grows.txt"].old_size, Some(2));
        assert_eq!(by_path["grows.txt"].new_size, Some(8));
        assert!(!by_path.contains_key("kept.txt"));
    }

    #[test]
    fn test_diff_output_sorted_by_path() {
        let dir = tempdir().unwrap();
        let before = take(dir.path()).unwrap();
        fs::write(dir.path().join("zzz.txt"), "z").unwrap();
        fs::write(dir.path().join("aaa.txt"), "a").unwrap();
        let after = take(dir.path()).unwrap();

        let changes = diff(&before, &after);
        let paths: Vec<_> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["aaa.txt", "zzz.txt"]);
    }

    #[test]
    fn test_filter_noise_drops_dirs_and_internal_paths() {
        let dir = tempdir().unwrap();
        let before = take(dir.path()).unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "x").unwrap();
        fs::create_dir(dir.path().join(".claude")).unwrap();
        fs::write(dir.path().join(".claude/state.json"), "{}").unwrap();
        let after = take(dir.path()).unwrap();

        let changes = filter_noise(diff(&before, &after), &before, &after);
        let paths: Vec<_> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["src/lib.rs"]);
    }

    #[test]
    fn test_changeset_json_round_trip() {
        let cs = SessionChangeset {
            session_id: "a1b2c3d4".into(),
            mount_changes: vec![MountChanges {
                source: PathBuf::from("/tmp/project"),
                target: "/workspace".into(),
                changes: vec![Change {
                    path: "src/main.rs".into(),
                    change_type: ChangeType::Modified,
                    old_size: Some(10),
                    new_size: Some(20),
                }],
            }],
            guest_changes: vec!["/etc/resolv.conf".into()],
            network_events: vec![],
        };

        let dir = tempdir().unwrap();
        let path = dir.path().join("changeset.json");
        save_changeset(&path, &cs).unwrap();
        assert_eq!(load_changeset(&path).unwrap(), cs);
    }

    #[test]
    fn test_parse_network_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("network.log");
        fs::write(
            &path,
            "[12.3] FAIZE_NET: IN= OUT=eth0 SRC=10.0.2.15 DST=140.82.114.4 LEN=60 PROTO=TCP SPT=45678 DPT=443\n\
             noise line\n\
             [13.1] FAIZE_DENY: IN= OUT=eth0 SRC=10.0.2.15 DST=1.2.3.4 LEN=60 PROTO=UDP SPT=9999 DPT=123\n",
        )
        .unwrap();

        let events = parse_network_log(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "CONN");
        assert_eq!(events[0].dst_ip, "140.82.114.4");
        assert_eq!(events[0].dst_port, 443);
        assert_eq!(events[1].action, "DENY");
        assert_eq!(events[1].proto, "UDP");
        assert_eq!(events[1].src_port, 9999);
    }

    #[test]
    fn test_parse_network_log_missing_file() {
        assert!(parse_network_log(Path::new("/nonexistent/network.log"))
            .unwrap()
            .is_empty());
    }
}
