//! Sync method dispatch and the per-method strategies.
//!
//! The set of methods is a closed enumeration; dispatch is an exhaustive
//! match through an explicit registry constructed once at startup, so an
//! unhandled method is a compile error rather than a runtime branch.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::process::{CommandResult, InvokeRequest, Invoker};
use crate::util::shell_escape;
use crate::vm::ssh::SshInfo;
use crate::vm::VmRecord;

/// Named strategy used to mirror files between host and VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    Rsync,
    Nfs,
    Smb,
    #[serde(rename = "virtualbox")]
    VirtualBox,
}

impl std::fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncMethod::Rsync => "rsync",
            SyncMethod::Nfs => "nfs",
            SyncMethod::Smb => "smb",
            SyncMethod::VirtualBox => "virtualbox",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for SyncMethod {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsync" => Ok(SyncMethod::Rsync),
            "nfs" => Ok(SyncMethod::Nfs),
            "smb" => Ok(SyncMethod::Smb),
            "virtualbox" => Ok(SyncMethod::VirtualBox),
            other => Err(SandboxError::unsupported("sync method", other)),
        }
    }
}

/// Direction of a synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    ToVm,
    FromVm,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::ToVm => f.write_str("to_vm"),
            SyncDirection::FromVm => f.write_str("from_vm"),
        }
    }
}

/// Everything a strategy needs for one pass.
pub struct SyncContext<'a> {
    pub vm_name: &'a str,
    pub record: &'a VmRecord,
    pub direction: SyncDirection,
    /// Restrict the pass to one path, relative to the synced tree root.
    pub path_filter: Option<&'a str>,
    pub ssh: &'a SshInfo,
    pub timeout: Duration,
}

/// A pluggable synchronization strategy. Returns the paths it touched,
/// relative to the synced tree root.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    async fn sync(&self, ctx: &SyncContext<'_>, invoker: &dyn Invoker) -> Result<Vec<String>>;
}

/// Explicit registry of the supported strategies, built once at process
/// start and passed by reference to consumers.
pub struct StrategyRegistry {
    rsync: RsyncStrategy,
    nfs: MountedShareStrategy,
    smb: MountedShareStrategy,
    virtualbox: MountedShareStrategy,
}

impl StrategyRegistry {
    pub fn new(rsync_binary: String) -> Self {
        Self {
            rsync: RsyncStrategy { binary: rsync_binary },
            nfs: MountedShareStrategy { method: "nfs" },
            smb: MountedShareStrategy { method: "smb" },
            virtualbox: MountedShareStrategy { method: "virtualbox" },
        }
    }

    pub async fn dispatch(
        &self,
        method: SyncMethod,
        ctx: &SyncContext<'_>,
        invoker: &dyn Invoker,
    ) -> Result<Vec<String>> {
        match method {
            SyncMethod::Rsync => self.rsync.sync(ctx, invoker).await,
            SyncMethod::Nfs => self.nfs.sync(ctx, invoker).await,
            SyncMethod::Smb => self.smb.sync(ctx, invoker).await,
            SyncMethod::VirtualBox => self.virtualbox.sync(ctx, invoker).await,
        }
    }
}

/// Transfers the tree with rsync over the VM's ssh transport.
pub struct RsyncStrategy {
    binary: String,
}

#[async_trait]
impl SyncStrategy for RsyncStrategy {
    async fn sync(&self, ctx: &SyncContext<'_>, invoker: &dyn Invoker) -> Result<Vec<String>> {
        let host_root = ctx.record.host_dir().display().to_string();
        let guest_root = ctx.record.guest_dir().trim_end_matches('/').to_string();
        let remote_root = format!("{}:{}", ctx.ssh.remote_prefix(), guest_root);

        let mut args: Vec<String> = vec![
            "-az".into(),
            "--out-format=%n".into(),
            "-e".into(),
            ctx.ssh.rsync_transport(),
        ];

        match ctx.path_filter {
            None => {
                // Full-tree pass mirrors the source side, deletions included.
                args.push("--delete".into());
                for pattern in &ctx.record.exclude_patterns {
                    args.push(format!("--exclude={}", pattern));
                }
                let (src, dst) = match ctx.direction {
                    SyncDirection::ToVm => {
                        (format!("{}/", host_root), format!("{}/", remote_root))
                    }
                    SyncDirection::FromVm => {
                        (format!("{}/", remote_root), format!("{}/", host_root))
                    }
                };
                args.push(src);
                args.push(dst);
            }
            Some(rel) => {
                // Single-path repair: no deletion sweep.
                let (src, dst) = match ctx.direction {
                    SyncDirection::ToVm => (
                        format!("{}/{}", host_root, rel),
                        format!("{}/{}", remote_root, rel),
                    ),
                    SyncDirection::FromVm => (
                        format!("{}/{}", remote_root, rel),
                        format!("{}/{}", host_root, rel),
                    ),
                };
                args.push(src);
                args.push(dst);
            }
        }

        debug!(vm = %ctx.vm_name, direction = %ctx.direction, "dispatching rsync");
        let result = invoker
            .invoke(
                InvokeRequest::new(self.binary.as_str(), args).timeout(Some(ctx.timeout)),
            )
            .await?;
        if !result.success() {
            return Err(SandboxError::operation_output(
                "rsync transfer",
                result.failure_output(),
            ));
        }

        Ok(touched_paths(&result))
    }
}

/// Strategies backed by a continuously mounted share (NFS, SMB, VirtualBox
/// shared folders). Changes propagate through the mount itself, so a sync
/// pass verifies the share is live rather than transferring files, and
/// reports no discrete paths.
pub struct MountedShareStrategy {
    method: &'static str,
}

#[async_trait]
impl SyncStrategy for MountedShareStrategy {
    async fn sync(&self, ctx: &SyncContext<'_>, invoker: &dyn Invoker) -> Result<Vec<String>> {
        let guest_root = ctx.record.guest_dir();
        let probe = format!("mountpoint -q {}", shell_escape(guest_root));
        let req = InvokeRequest::new("ssh", ctx.ssh.ssh_args(&probe))
            .timeout(Some(ctx.timeout));

        debug!(vm = %ctx.vm_name, method = self.method, "verifying mounted share");
        let result = invoker.invoke(req).await?;
        if !result.success() {
            return Err(SandboxError::operation_output(
                "verify shared folder mount",
                format!(
                    "{} share is not mounted at {}: {}",
                    self.method,
                    guest_root,
                    result.failure_output()
                ),
            ));
        }
        Ok(Vec::new())
    }
}

/// Extract touched file paths from rsync `--out-format=%n` output.
fn touched_paths(result: &CommandResult) -> Vec<String> {
    result
        .stdout_lossy()
        .lines()
        .map(|line| line.strip_prefix("deleting ").unwrap_or(line))
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "./" && !line.ends_with('/'))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ok_with_stdout, ScriptedInvoker};
    use std::path::PathBuf;

    fn record() -> VmRecord {
        VmRecord {
            name: "dev-1".into(),
            box_image: "ubuntu/focal64".into(),
            cpus: 2,
            memory_mb: 1024,
            project_path: PathBuf::from("/srv/project"),
            sync_method: SyncMethod::Rsync,
            host_path: None,
            guest_path: None,
            exclude_patterns: vec![".git".into(), "node_modules".into()],
            ports: Vec::new(),
            environment: Vec::new(),
            provisioners: Vec::new(),
        }
    }

    fn ssh_info() -> SshInfo {
        SshInfo {
            host: "127.0.0.1".into(),
            port: "2222".into(),
            user: "vagrant".into(),
            identity_file: "/k".into(),
        }
    }

    fn ctx<'a>(
        record: &'a VmRecord,
        ssh: &'a SshInfo,
        direction: SyncDirection,
        path_filter: Option<&'a str>,
    ) -> SyncContext<'a> {
        SyncContext {
            vm_name: "dev-1",
            record,
            direction,
            path_filter,
            ssh,
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn method_parses_known_names() {
        assert_eq!("rsync".parse::<SyncMethod>().unwrap(), SyncMethod::Rsync);
        assert_eq!("nfs".parse::<SyncMethod>().unwrap(), SyncMethod::Nfs);
        assert_eq!("smb".parse::<SyncMethod>().unwrap(), SyncMethod::Smb);
        assert_eq!(
            "virtualbox".parse::<SyncMethod>().unwrap(),
            SyncMethod::VirtualBox
        );
    }

    #[test]
    fn method_rejects_unknown_names() {
        let err = "carrier-pigeon".parse::<SyncMethod>().unwrap_err();
        assert!(matches!(err, SandboxError::Unsupported { .. }));
    }

    #[test]
    fn method_serde_uses_lowercase_tags() {
        let json = serde_json::to_string(&SyncMethod::VirtualBox).unwrap();
        assert_eq!(json, "\"virtualbox\"");
        let back: SyncMethod = serde_json::from_str("\"nfs\"").unwrap();
        assert_eq!(back, SyncMethod::Nfs);
    }

    #[tokio::test]
    async fn rsync_full_tree_to_vm_argv() {
        let invoker = ScriptedInvoker::new(|_| Ok(ok_with_stdout("a.txt\nsrc/b.rs\n")));
        let rec = record();
        let ssh = ssh_info();
        let registry = StrategyRegistry::new("rsync".into());

        let touched = registry
            .dispatch(
                SyncMethod::Rsync,
                &ctx(&rec, &ssh, SyncDirection::ToVm, None),
                invoker.as_ref(),
            )
            .await
            .unwrap();

        assert_eq!(touched, vec!["a.txt", "src/b.rs"]);
        let call = &invoker.calls()[0];
        assert_eq!(call.program, "rsync");
        assert!(call.args.contains(&"--delete".to_string()));
        assert!(call.args.contains(&"--exclude=.git".to_string()));
        assert!(call.args.contains(&"--exclude=node_modules".to_string()));
        // Host source, remote destination, both with trailing slashes.
        assert_eq!(call.args[call.args.len() - 2], "/srv/project/");
        assert_eq!(
            call.args[call.args.len() - 1],
            "vagrant@127.0.0.1:/vagrant/"
        );
    }

    #[tokio::test]
    async fn rsync_full_tree_from_vm_swaps_endpoints() {
        let invoker = ScriptedInvoker::new(|_| Ok(ok_with_stdout("")));
        let rec = record();
        let ssh = ssh_info();
        let registry = StrategyRegistry::new("rsync".into());

        registry
            .dispatch(
                SyncMethod::Rsync,
                &ctx(&rec, &ssh, SyncDirection::FromVm, None),
                invoker.as_ref(),
            )
            .await
            .unwrap();

        let call = &invoker.calls()[0];
        assert_eq!(
            call.args[call.args.len() - 2],
            "vagrant@127.0.0.1:/vagrant/"
        );
        assert_eq!(call.args[call.args.len() - 1], "/srv/project/");
    }

    #[tokio::test]
    async fn rsync_single_path_omits_delete_and_excludes() {
        let invoker = ScriptedInvoker::new(|_| Ok(ok_with_stdout("src/app.rs\n")));
        let rec = record();
        let ssh = ssh_info();
        let registry = StrategyRegistry::new("rsync".into());

        let touched = registry
            .dispatch(
                SyncMethod::Rsync,
                &ctx(&rec, &ssh, SyncDirection::ToVm, Some("src/app.rs")),
                invoker.as_ref(),
            )
            .await
            .unwrap();

        assert_eq!(touched, vec!["src/app.rs"]);
        let call = &invoker.calls()[0];
        assert!(!call.args.contains(&"--delete".to_string()));
        assert!(!call.args.iter().any(|a| a.starts_with("--exclude=")));
        assert_eq!(call.args[call.args.len() - 2], "/srv/project/src/app.rs");
        assert_eq!(
            call.args[call.args.len() - 1],
            "vagrant@127.0.0.1:/vagrant/src/app.rs"
        );
    }

    #[tokio::test]
    async fn rsync_failure_carries_process_output() {
        let invoker =
            ScriptedInvoker::new(|_| Ok(crate::testing::failure(23, "permission denied")));
        let rec = record();
        let ssh = ssh_info();
        let registry = StrategyRegistry::new("rsync".into());

        let err = registry
            .dispatch(
                SyncMethod::Rsync,
                &ctx(&rec, &ssh, SyncDirection::ToVm, None),
                invoker.as_ref(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn mounted_share_verifies_mountpoint() {
        let invoker = ScriptedInvoker::new(|_| Ok(ok_with_stdout("")));
        let rec = record();
        let ssh = ssh_info();
        let registry = StrategyRegistry::new("rsync".into());

        for method in [SyncMethod::Nfs, SyncMethod::Smb, SyncMethod::VirtualBox] {
            let touched = registry
                .dispatch(
                    method,
                    &ctx(&rec, &ssh, SyncDirection::ToVm, None),
                    invoker.as_ref(),
                )
                .await
                .unwrap();
            assert!(touched.is_empty());
        }

        for call in invoker.calls() {
            assert_eq!(call.program, "ssh");
            assert!(call
                .args
                .last()
                .unwrap()
                .contains("mountpoint -q '/vagrant'"));
        }
    }

    #[tokio::test]
    async fn mounted_share_missing_mount_is_operation_failed() {
        let invoker = ScriptedInvoker::new(|_| Ok(crate::testing::failure(1, "")));
        let rec = record();
        let ssh = ssh_info();
        let registry = StrategyRegistry::new("rsync".into());

        let err = registry
            .dispatch(
                SyncMethod::Nfs,
                &ctx(&rec, &ssh, SyncDirection::FromVm, None),
                invoker.as_ref(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not mounted"));
    }

    #[test]
    fn touched_paths_skips_directories_and_deletion_prefix() {
        let result = ok_with_stdout("./\nsrc/\nsrc/a.rs\ndeleting old.txt\n\n");
        assert_eq!(touched_paths(&result), vec!["src/a.rs", "old.txt"]);
    }
}
