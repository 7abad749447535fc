//! Conflict model: detection helpers and resolution parsing.
//!
//! A path is considered conflicted when both the host and the guest copy
//! have changed since the last successful sync in the respective direction.
//! Detection is modification-time based: host mtimes newer than the last
//! to-VM sync intersected with guest mtimes newer than the last from-VM
//! sync. False positives (a touch without an edit) are acceptable because
//! every resolution is explicit.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, SandboxError};

/// An unresolved divergence on one path, relative to the synced tree root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncConflict {
    pub path: String,
    pub detected_at: DateTime<Utc>,
}

/// How to resolve a recorded conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Re-sync the host copy onto the guest.
    UseHost,
    /// Re-sync the guest copy onto the host.
    UseVm,
    /// Three-way merge both copies, then push the result to the guest.
    Merge,
    /// Keep the guest copy alongside the host copy as `<path>.vm`.
    KeepBoth,
}

impl std::str::FromStr for Resolution {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "use_host" => Ok(Resolution::UseHost),
            "use_vm" => Ok(Resolution::UseVm),
            "merge" => Ok(Resolution::Merge),
            "keep_both" => Ok(Resolution::KeepBoth),
            other => Err(SandboxError::unsupported("conflict resolution", other)),
        }
    }
}

/// Basename glob matching for exclude patterns. Supports `*` wildcards;
/// everything else matches literally.
pub(crate) fn matches_exclude(name: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return name == pattern;
    }
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Walk the host tree and collect files (relative paths) modified after
/// `since`, skipping excluded names.
pub(crate) fn host_files_newer_than(
    root: &Path,
    excludes: &[String],
    since: DateTime<Utc>,
) -> Result<HashSet<String>> {
    let mut changed = HashSet::new();
    collect_newer(root, root, excludes, since, &mut changed)?;
    Ok(changed)
}

fn collect_newer(
    root: &Path,
    dir: &Path,
    excludes: &[String],
    since: DateTime<Utc>,
    out: &mut HashSet<String>,
) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SandboxError::operation_failed("walk project directory", e))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| SandboxError::operation_failed("walk project directory", e))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if excludes.iter().any(|p| matches_exclude(&name, p)) {
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|e| SandboxError::operation_failed("stat project file", e))?;
        if meta.is_dir() {
            collect_newer(root, &path, excludes, since, out)?;
        } else if meta.is_file() {
            let modified: DateTime<Utc> = meta
                .modified()
                .map_err(|e| SandboxError::operation_failed("stat project file", e))?
                .into();
            if modified > since {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.insert(rel.to_string_lossy().into_owned());
                }
            }
        }
    }
    Ok(())
}

/// Build a pseudo-base for three-way merging from the common leading and
/// trailing lines of the two divergent versions.
pub(crate) fn common_base(host: &str, vm: &str) -> String {
    let host_lines: Vec<&str> = host.split('\n').collect();
    let vm_lines: Vec<&str> = vm.split('\n').collect();

    let mut prefix = 0;
    while prefix < host_lines.len()
        && prefix < vm_lines.len()
        && host_lines[prefix] == vm_lines[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < host_lines.len() - prefix
        && suffix < vm_lines.len() - prefix
        && host_lines[host_lines.len() - 1 - suffix] == vm_lines[vm_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mut base: Vec<&str> = Vec::new();
    base.extend(&host_lines[..prefix]);
    base.extend(&host_lines[host_lines.len() - suffix..]);
    base.join("\n")
}
