//! Command execution inside VMs, sequenced around synchronization.
//!
//! Per invocation: precondition check, optional to-VM sync (the command is
//! never started if a required pre-sync fails), the remote process with
//! concurrent output capture, then an optional from-VM sync that runs
//! whenever the process actually terminated — including on nonzero exit,
//! but not when it failed to start.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, SandboxError};
use crate::process::{
    CommandResult, InvokeRequest, Invoker, OutputMode, SshInvoker, StreamCallback,
};
use crate::sync::{SyncDirection, SyncEngine};
use crate::util::{export_statement, shell_escape};
use crate::vm::{VmManager, VmState};

/// Per-invocation execution parameters.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub vm_name: String,
    /// Working directory inside the VM. Relative paths resolve under the
    /// VM's synced tree root.
    pub working_dir: Option<String>,
    /// Environment exported into the remote shell before the command.
    pub env: Vec<(String, String)>,
    pub sync_before: bool,
    pub sync_after: bool,
    pub timeout: Option<Duration>,
}

/// Result of a synchronized execution.
#[derive(Debug)]
pub struct ExecOutcome {
    pub command: CommandResult,
    /// Set when the post-execution sync was attempted and failed. The
    /// command result above is still valid; the host tree may be stale.
    pub post_sync_error: Option<String>,
}

/// Result of launching a detached background task. Once launched, the task
/// is opaque to the orchestrator: completion is neither tracked nor
/// awaited, and no post-sync applies.
#[derive(Debug, Serialize)]
pub struct BackgroundLaunch {
    pub log_file: String,
    pub exit_code: i32,
}

/// Sequences command execution around synchronization.
pub struct Executor {
    vms: Arc<VmManager>,
    sync: Arc<SyncEngine>,
    invoker: Arc<dyn Invoker>,
}

impl Executor {
    pub fn new(vms: Arc<VmManager>, sync: Arc<SyncEngine>, invoker: Arc<dyn Invoker>) -> Self {
        Self { vms, sync, invoker }
    }

    /// Execute a command in a VM.
    ///
    /// Output handling follows `mode`: captured into the result, streamed
    /// through `on_output`, or both. Stdout and stderr are drained
    /// concurrently; byte order within each stream is preserved, ordering
    /// between the streams is not defined.
    pub async fn execute(
        &self,
        command: &str,
        ctx: &ExecutionContext,
        mode: OutputMode,
        on_output: Option<StreamCallback>,
    ) -> Result<ExecOutcome> {
        self.check_target(ctx)?;
        self.require_running(&ctx.vm_name).await?;

        if ctx.sync_before {
            info!(vm = %ctx.vm_name, "syncing to VM before command");
            self.sync
                .sync(&ctx.vm_name, SyncDirection::ToVm, None)
                .await?;
        }

        let record = self.vms.get_config(&ctx.vm_name).await?;
        let ssh = self.vms.ssh_info(&ctx.vm_name).await?;
        let remote_command = build_remote_command(command, ctx, record.guest_dir());

        let req = InvokeRequest::new(remote_command, Vec::<String>::new())
            .timeout(ctx.timeout)
            .output(mode, on_output);
        let result = SshInvoker::new(Arc::clone(&self.invoker), ssh)
            .invoke(req)
            .await?;

        // The process terminated (whatever its exit code); the post-sync is
        // attempted exactly once. A spawn failure returned above never
        // reaches this point.
        let post_sync_error = if ctx.sync_after {
            info!(vm = %ctx.vm_name, "syncing from VM after command");
            match self
                .sync
                .sync(&ctx.vm_name, SyncDirection::FromVm, None)
                .await
            {
                Ok(_) => None,
                Err(e) => {
                    warn!(vm = %ctx.vm_name, error = %e, "post-execution sync failed");
                    Some(e.to_string())
                }
            }
        } else {
            None
        };

        Ok(ExecOutcome { command: result, post_sync_error })
    }

    /// Launch a command as a detached background task inside the VM.
    ///
    /// The command is rewritten to run under `nohup` with output redirected
    /// to a VM-local log file keyed by VM name; only the launcher is waited
    /// on. An optional pre-sync applies; there is never a post-sync.
    pub async fn execute_background(
        &self,
        command: &str,
        ctx: &ExecutionContext,
    ) -> Result<BackgroundLaunch> {
        self.check_target(ctx)?;
        self.require_running(&ctx.vm_name).await?;

        if ctx.sync_before {
            info!(vm = %ctx.vm_name, "syncing to VM before background task");
            self.sync
                .sync(&ctx.vm_name, SyncDirection::ToVm, None)
                .await?;
        }

        let record = self.vms.get_config(&ctx.vm_name).await?;
        let ssh = self.vms.ssh_info(&ctx.vm_name).await?;

        let log_file = format!("/tmp/bg_{}.log", ctx.vm_name);
        let detached = format!("nohup {} > {} 2>&1 &", command, log_file);
        let remote_command = build_remote_command(&detached, ctx, record.guest_dir());

        let req = InvokeRequest::new(remote_command, Vec::<String>::new())
            .timeout(ctx.timeout)
            .output(OutputMode::Capture, None);
        let result = SshInvoker::new(Arc::clone(&self.invoker), ssh)
            .invoke(req)
            .await?;

        if !result.success() {
            return Err(SandboxError::operation_output(
                "launch background task",
                result.failure_output(),
            ));
        }

        info!(vm = %ctx.vm_name, log_file = %log_file, "background task launched");
        Ok(BackgroundLaunch { log_file, exit_code: result.exit_code })
    }

    /// Commands must target a VM, never the host.
    fn check_target(&self, ctx: &ExecutionContext) -> Result<()> {
        if ctx.vm_name.is_empty() || ctx.vm_name.eq_ignore_ascii_case("host") {
            return Err(SandboxError::unsupported(
                "execution target",
                ctx.vm_name.clone(),
            ));
        }
        Ok(())
    }

    async fn require_running(&self, vm_name: &str) -> Result<()> {
        let state = self.vms.state(vm_name).await?;
        if state != VmState::Running {
            return Err(SandboxError::invalid_state(vm_name, state));
        }
        Ok(())
    }
}

/// Assemble the remote shell command line: environment exports, working
/// directory change, then the command itself.
fn build_remote_command(command: &str, ctx: &ExecutionContext, guest_root: &str) -> String {
    let mut cmd = command.to_string();

    if let Some(wd) = ctx.working_dir.as_deref().filter(|wd| !wd.is_empty()) {
        let dir = if wd.starts_with('/') {
            wd.to_string()
        } else {
            format!("{}/{}", guest_root.trim_end_matches('/'), wd)
        };
        cmd = format!("cd {} && {}", shell_escape(&dir), cmd);
    }

    if !ctx.env.is_empty() {
        let exports: Vec<String> = ctx
            .env
            .iter()
            .map(|(key, value)| export_statement(key, value))
            .collect();
        cmd = format!("{} && {}", exports.join("; "), cmd);
    }

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sync::SyncMethod;
    use crate::testing::{failure, ok_with_stdout, result_with, ScriptedInvoker};
    use crate::vm::VmRecord;
    use std::path::Path;

    const SSH_CONFIG: &str =
        "Host default\n  HostName 127.0.0.1\n  User vagrant\n  Port 2222\n  IdentityFile /k\n";
    const STATUS_RUNNING: &str = "1700000000,default,state,running\n";
    const STATUS_POWEROFF: &str = "1700000000,default,state,poweroff\n";

    struct Fixture {
        executor: Executor,
        invoker: Arc<ScriptedInvoker>,
        _base: tempfile::TempDir,
        _project: tempfile::TempDir,
    }

    async fn fixture(invoker: Arc<ScriptedInvoker>) -> Fixture {
        let base = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.vm.base_dir = base.path().to_path_buf();

        let vms = Arc::new(VmManager::new(&config, invoker.clone()).unwrap());
        let record = VmRecord {
            name: String::new(),
            box_image: "ubuntu/focal64".into(),
            cpus: 2,
            memory_mb: 1024,
            project_path: project.path().to_path_buf(),
            sync_method: SyncMethod::Rsync,
            host_path: None,
            guest_path: None,
            exclude_patterns: Vec::new(),
            ports: Vec::new(),
            environment: Vec::new(),
            provisioners: Vec::new(),
        };
        vms.create("dev-1", project.path(), record).await.unwrap();

        let sync = Arc::new(SyncEngine::new(&config, Arc::clone(&vms), invoker.clone()));
        let executor = Executor::new(vms, sync, invoker.clone());
        Fixture { executor, invoker, _base: base, _project: project }
    }

    /// Routes vagrant/ssh/rsync invocations for the common happy path.
    fn happy_invoker() -> Arc<ScriptedInvoker> {
        ScriptedInvoker::new(|req| match req.program.as_str() {
            "rsync" => Ok(ok_with_stdout("synced.txt\n")),
            "ssh" => Ok(ok_with_stdout("command output")),
            _ => match req.args.first().map(String::as_str) {
                Some("status") => Ok(ok_with_stdout(STATUS_RUNNING)),
                Some("ssh-config") => Ok(ok_with_stdout(SSH_CONFIG)),
                _ => Ok(ok_with_stdout("")),
            },
        })
    }

    fn ctx(sync_before: bool, sync_after: bool) -> ExecutionContext {
        ExecutionContext {
            vm_name: "dev-1".into(),
            sync_before,
            sync_after,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn executes_and_captures_output() {
        let fx = fixture(happy_invoker()).await;
        let outcome = fx
            .executor
            .execute("echo hi", &ctx(false, false), OutputMode::Capture, None)
            .await
            .unwrap();
        assert_eq!(outcome.command.exit_code, 0);
        assert_eq!(outcome.command.stdout, b"command output");
        assert!(outcome.post_sync_error.is_none());
    }

    #[tokio::test]
    async fn rejects_host_target() {
        let fx = fixture(happy_invoker()).await;
        let mut bad = ctx(false, false);
        bad.vm_name = "host".into();
        let err = fx
            .executor
            .execute("id", &bad, OutputMode::Capture, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Unsupported { .. }));

        bad.vm_name = String::new();
        assert!(fx
            .executor
            .execute("id", &bad, OutputMode::Capture, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn requires_running_vm() {
        let invoker = ScriptedInvoker::new(|req| match req.program.as_str() {
            "ssh" | "rsync" => panic!("must not run against a stopped VM"),
            _ => match req.args.first().map(String::as_str) {
                Some("status") => Ok(ok_with_stdout(STATUS_POWEROFF)),
                _ => Ok(ok_with_stdout("")),
            },
        });
        let fx = fixture(invoker).await;
        let err = fx
            .executor
            .execute("id", &ctx(false, false), OutputMode::Capture, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn not_created_vm_is_invalid_state() {
        let fx = fixture(happy_invoker()).await;
        let mut unknown = ctx(false, false);
        unknown.vm_name = "ghost".into();
        let err = fx
            .executor
            .execute("id", &unknown, OutputMode::Capture, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn failed_pre_sync_prevents_command_start() {
        let invoker = ScriptedInvoker::new(|req| match req.program.as_str() {
            "rsync" => Ok(failure(23, "sync broke")),
            "ssh" => panic!("command must not start after a failed pre-sync"),
            _ => match req.args.first().map(String::as_str) {
                Some("status") => Ok(ok_with_stdout(STATUS_RUNNING)),
                Some("ssh-config") => Ok(ok_with_stdout(SSH_CONFIG)),
                _ => Ok(ok_with_stdout("")),
            },
        });
        let fx = fixture(invoker).await;
        let err = fx
            .executor
            .execute("make", &ctx(true, true), OutputMode::Capture, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sync broke"));
        assert!(!fx.invoker.calls().iter().any(|c| c.program == "ssh"));
    }

    #[tokio::test]
    async fn post_sync_runs_after_nonzero_exit() {
        let invoker = ScriptedInvoker::new(|req| match req.program.as_str() {
            "rsync" => Ok(ok_with_stdout("")),
            "ssh" => Ok(result_with(2, "", "tests failed")),
            _ => match req.args.first().map(String::as_str) {
                Some("status") => Ok(ok_with_stdout(STATUS_RUNNING)),
                Some("ssh-config") => Ok(ok_with_stdout(SSH_CONFIG)),
                _ => Ok(ok_with_stdout("")),
            },
        });
        let fx = fixture(invoker).await;
        let outcome = fx
            .executor
            .execute("make test", &ctx(true, true), OutputMode::Capture, None)
            .await
            .unwrap();

        assert_eq!(outcome.command.exit_code, 2);
        assert!(outcome.post_sync_error.is_none());

        // Pre-sync, command, post-sync: two rsync passes around one ssh.
        let programs: Vec<String> = fx
            .invoker
            .calls()
            .iter()
            .map(|c| c.program.clone())
            .filter(|p| p == "rsync" || p == "ssh")
            .collect();
        assert_eq!(programs, vec!["rsync", "ssh", "rsync"]);
    }

    #[tokio::test]
    async fn post_sync_failure_is_reported_alongside_result() {
        let invoker = ScriptedInvoker::new(|req| match req.program.as_str() {
            "rsync" => Ok(failure(12, "pipe closed")),
            "ssh" => Ok(ok_with_stdout("done")),
            _ => match req.args.first().map(String::as_str) {
                Some("status") => Ok(ok_with_stdout(STATUS_RUNNING)),
                Some("ssh-config") => Ok(ok_with_stdout(SSH_CONFIG)),
                _ => Ok(ok_with_stdout("")),
            },
        });
        let fx = fixture(invoker).await;
        let outcome = fx
            .executor
            .execute("make", &ctx(false, true), OutputMode::Capture, None)
            .await
            .unwrap();
        assert_eq!(outcome.command.exit_code, 0);
        assert!(outcome
            .post_sync_error
            .as_deref()
            .unwrap()
            .contains("pipe closed"));
    }

    #[tokio::test]
    async fn remote_command_carries_cd_and_exports() {
        let fx = fixture(happy_invoker()).await;
        let mut context = ctx(false, false);
        context.working_dir = Some("api".into());
        context.env = vec![("APP_ENV".into(), "test".into())];

        fx.executor
            .execute("cargo test", &context, OutputMode::Capture, None)
            .await
            .unwrap();

        let ssh_call = fx
            .invoker
            .calls()
            .into_iter()
            .find(|c| c.program == "ssh")
            .unwrap();
        let remote = ssh_call.args.last().unwrap().clone();
        assert!(remote.contains("export APP_ENV='test'"));
        assert!(remote.contains("cd '/vagrant/api' &&"));
        assert!(remote.ends_with("cargo test"));
    }

    #[tokio::test]
    async fn absolute_working_dir_is_used_verbatim() {
        let fx = fixture(happy_invoker()).await;
        let mut context = ctx(false, false);
        context.working_dir = Some("/opt/app".into());

        fx.executor
            .execute("ls", &context, OutputMode::Capture, None)
            .await
            .unwrap();

        let ssh_call = fx
            .invoker
            .calls()
            .into_iter()
            .find(|c| c.program == "ssh")
            .unwrap();
        assert!(ssh_call.args.last().unwrap().contains("cd '/opt/app' &&"));
    }

    #[tokio::test]
    async fn background_task_is_detached_and_skips_post_sync() {
        let fx = fixture(happy_invoker()).await;
        let mut context = ctx(true, true); // sync_after must be ignored
        context.working_dir = Some("api".into());

        let launch = fx
            .executor
            .execute_background("npm run watch", &context)
            .await
            .unwrap();
        assert_eq!(launch.log_file, "/tmp/bg_dev-1.log");
        assert_eq!(launch.exit_code, 0);

        let calls = fx.invoker.calls();
        let ssh_call = calls.iter().find(|c| c.program == "ssh").unwrap();
        let remote = ssh_call.args.last().unwrap();
        assert!(remote.contains("nohup npm run watch > /tmp/bg_dev-1.log 2>&1 &"));
        assert!(remote.contains("cd '/vagrant/api' &&"));

        // One pre-sync pass, no post-sync pass.
        let rsync_count = calls.iter().filter(|c| c.program == "rsync").count();
        assert_eq!(rsync_count, 1);
    }

    #[tokio::test]
    async fn background_launch_failure_surfaces() {
        let invoker = ScriptedInvoker::new(|req| match req.program.as_str() {
            "ssh" => Ok(failure(255, "connection refused")),
            _ => match req.args.first().map(String::as_str) {
                Some("status") => Ok(ok_with_stdout(STATUS_RUNNING)),
                Some("ssh-config") => Ok(ok_with_stdout(SSH_CONFIG)),
                _ => Ok(ok_with_stdout("")),
            },
        });
        let fx = fixture(invoker).await;
        let err = fx
            .executor
            .execute_background("sleep 100", &ctx(false, false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn remote_command_without_extras_is_untouched() {
        let context = ExecutionContext { vm_name: "dev-1".into(), ..Default::default() };
        assert_eq!(build_remote_command("ls -la", &context, "/vagrant"), "ls -la");
    }

    #[test]
    fn remote_command_orders_exports_before_cd() {
        let context = ExecutionContext {
            vm_name: "dev-1".into(),
            working_dir: Some("srv".into()),
            env: vec![("A".into(), "1".into()), ("B".into(), "2".into())],
            ..Default::default()
        };
        let remote = build_remote_command("run", &context, "/vagrant");
        assert_eq!(
            remote,
            "export A='1'; export B='2' && cd '/vagrant/srv' && run"
        );
    }
}
