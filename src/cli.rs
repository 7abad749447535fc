//! CLI-only subcommand implementations: `check` and `status`.
//!
//! These commands do not start the MCP server. They are useful for
//! debugging the host environment before wiring the server into an MCP
//! client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::process::LocalInvoker;
use crate::vm::{VmManager, VmState};

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `devsandbox check`. Returns `Ok(())` if all checks pass.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_binary("Vagrant", &config.vm.vagrant_binary, "Install Vagrant: https://developer.hashicorp.com/vagrant/install"),
        check_binary("rsync", &config.sync.rsync_binary, "Install rsync: apt install rsync"),
        check_binary("ssh", "ssh", "Install an OpenSSH client: apt install openssh-client"),
        check_binary("diff3", "diff3", "Install diffutils: apt install diffutils"),
        check_base_dir(config),
    ];

    let all_pass = checks.iter().all(|c| c.ok);

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if !c.ok {
            if let Some(fix) = &c.fix {
                println!("    Fix: {}", fix);
            }
        }
    }

    println!();
    if all_pass {
        println!("All checks passed. Run: devsandbox serve --config config.toml");
        Ok(())
    } else {
        let failed = checks.iter().filter(|c| !c.ok).count();
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_binary(label: &'static str, binary: &str, fix: &str) -> Check {
    match std::process::Command::new(binary).arg("--version").output() {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout);
            let version = version.lines().next().unwrap_or("unknown").trim().to_string();
            Check::pass(label, version)
        }
        Ok(out) => {
            // ssh prints its version on stderr and exits nonzero for
            // --version on some builds; accept any output mentioning it.
            let stderr = String::from_utf8_lossy(&out.stderr);
            if label == "ssh" && stderr.contains("OpenSSH") {
                let version = stderr.lines().next().unwrap_or("unknown").trim().to_string();
                return Check::pass(label, version);
            }
            Check::fail(
                label,
                format!("{} exited with error: {}", binary, stderr.trim()),
                fix,
            )
        }
        Err(e) => Check::fail(label, format!("{} not found: {}", binary, e), fix),
    }
}

fn check_base_dir(config: &Config) -> Check {
    let dir = &config.vm.base_dir;
    if let Err(e) = std::fs::create_dir_all(dir) {
        return Check::fail(
            "Base directory",
            format!("{} could not be created: {}", dir.display(), e),
            format!("mkdir -p {}", dir.display()),
        );
    }

    // Probe writability with a scratch file.
    let probe = dir.join(".devsandbox-check");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Check::pass("Base directory", dir.display().to_string())
        }
        Err(e) => Check::fail(
            "Base directory",
            format!("{} is not writable: {}", dir.display(), e),
            format!("chmod u+w {} or run devsandbox as a user with write access", dir.display()),
        ),
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Run `devsandbox status`: list persisted VMs with their probed states.
/// Informational only.
pub async fn run_status(config: &Config) -> Result<()> {
    let vms = VmManager::new(config, Arc::new(LocalInvoker))?;
    let names = vms.list().await?;

    if names.is_empty() {
        println!("No VMs under {}", config.vm.base_dir.display());
        println!("Create one through an MCP client: vm_create(name=..., project_path=...)");
        return Ok(());
    }

    println!("VMs in {}:\n", config.vm.base_dir.display());
    println!("{:<20} {:<12} {:<8} {:<10} {:<10} PROJECT", "NAME", "STATE", "CPUS", "MEMORY", "SYNC");
    for name in names {
        let state = match vms.state(&name).await {
            Ok(state) => state.to_string(),
            Err(_) => VmState::Unknown.to_string(),
        };
        match vms.get_config(&name).await {
            Ok(record) => println!(
                "{:<20} {:<12} {:<8} {:<10} {:<10} {}",
                record.name,
                state,
                record.cpus,
                format!("{}MB", record.memory_mb),
                record.sync_method.to_string(),
                record.project_path.display(),
            ),
            Err(e) => println!("{:<20} {:<12} (config unreadable: {})", name, state, e),
        }
    }

    Ok(())
}

/// Load a config from an optional path, falling back to defaults.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}
