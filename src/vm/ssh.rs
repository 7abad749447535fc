//! Parsing of `vagrant ssh-config` output and ssh argv construction.
//!
//! The output is OpenSSH client-config style: whitespace-separated
//! `Key Value` lines (first token is the key, the remainder is the value),
//! blank lines skipped.

use std::collections::HashMap;

use crate::error::{Result, SandboxError};

/// Connection info for reaching a VM's shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshInfo {
    pub host: String,
    pub port: String,
    pub user: String,
    pub identity_file: String,
}

impl SshInfo {
    /// Build the argv tail for `ssh` running `remote_command` on this VM.
    ///
    /// Host key checking is disabled: sandbox VMs are disposable and their
    /// host keys change on every recreate.
    pub fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        vec![
            "-p".into(),
            self.port.clone(),
            "-i".into(),
            self.identity_file.clone(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            format!("{}@{}", self.user, self.host),
            remote_command.to_string(),
        ]
    }

    /// The `user@host` form used by rsync's remote specs.
    pub fn remote_prefix(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// The `-e` transport argument for rsync.
    pub fn rsync_transport(&self) -> String {
        format!(
            "ssh -p {} -i {} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
            self.port, self.identity_file
        )
    }
}

/// Parse `vagrant ssh-config` output.
///
/// Fails with a parse error when any of the four required keys (HostName,
/// Port, User, IdentityFile) is missing.
pub fn parse_ssh_config(output: &str) -> Result<SshInfo> {
    let mut values: HashMap<&str, &str> = HashMap::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(char::is_whitespace) {
            values.insert(key, value.trim());
        }
    }

    let required = |key: &str| -> Result<String> {
        values
            .get(key)
            .map(|v| v.to_string())
            .ok_or_else(|| {
                SandboxError::parse("ssh config", format!("missing '{}' line", key))
            })
    };

    Ok(SshInfo {
        host: required("HostName")?,
        port: required("Port")?,
        user: required("User")?,
        identity_file: required("IdentityFile")?,
    })
}
