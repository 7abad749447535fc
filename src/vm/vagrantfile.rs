//! Vagrantfile rendering.
//!
//! The Vagrantfile is the declarative configuration handed to the external
//! VM-control process. Rendering is pure; the caller writes the file and
//! runs `vagrant validate` against it.

use crate::sync::SyncMethod;
use crate::vm::VmRecord;

/// Render the Vagrantfile for a VM record.
pub fn render(record: &VmRecord) -> String {
    format!(
        r#"# -*- mode: ruby -*-
# vi: set ft=ruby :
# Generated by devsandbox

Vagrant.configure("2") do |config|
  # Box settings
  config.vm.box = "{box_image}"

  # Provider-specific configuration
  config.vm.provider "virtualbox" do |vb|
    vb.gui = false
    vb.name = "{name}"
    vb.memory = {memory}
    vb.cpus = {cpus}

    vb.customize ["modifyvm", :id, "--natdnshostresolver1", "on"]
    vb.customize ["modifyvm", :id, "--natdnsproxy1", "on"]
    vb.customize ["modifyvm", :id, "--ioapic", "on"]
  end

  # Network settings
{ports}
  # Sync settings
{synced_folder}

  # Provisioning
  config.vm.provision "shell", inline: <<-SHELL
    apt-get update
    apt-get install -y build-essential curl git unzip rsync
{environment}    echo "Development VM setup completed!"
  SHELL
end
"#,
        box_image = record.box_image,
        name = record.name,
        memory = record.memory_mb,
        cpus = record.cpus,
        ports = ports_block(record),
        synced_folder = synced_folder_block(record),
        environment = environment_block(record),
    )
}

fn ports_block(record: &VmRecord) -> String {
    let mut block = String::new();
    for port in &record.ports {
        block.push_str(&format!(
            "  config.vm.network \"forwarded_port\", guest: {}, host: {}, host_ip: \"127.0.0.1\"\n",
            port.guest, port.host
        ));
    }
    block
}

fn synced_folder_block(record: &VmRecord) -> String {
    let host = record.host_dir().display().to_string();
    let guest = record.guest_dir();
    match record.sync_method {
        SyncMethod::Rsync => {
            let excludes = record
                .exclude_patterns
                .iter()
                .map(|p| format!("\"{}\"", p))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "  config.vm.synced_folder \"{host}\", \"{guest}\",\n    type: \"rsync\",\n    rsync__exclude: [{excludes}],\n    rsync__args: [\"--verbose\", \"--archive\", \"--delete\", \"-z\"]"
            )
        }
        SyncMethod::Nfs => format!(
            "  config.vm.synced_folder \"{host}\", \"{guest}\",\n    type: \"nfs\",\n    nfs_udp: false,\n    nfs_version: 4"
        ),
        SyncMethod::Smb => format!(
            "  config.vm.synced_folder \"{host}\", \"{guest}\",\n    type: \"smb\""
        ),
        SyncMethod::VirtualBox => {
            format!("  config.vm.synced_folder \"{host}\", \"{guest}\"")
        }
    }
}

fn environment_block(record: &VmRecord) -> String {
    let mut block = String::new();
    for line in &record.environment {
        block.push_str("    ");
        block.push_str(line);
        block.push('\n');
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::PortForward;
    use std::path::PathBuf;

    fn record(method: SyncMethod) -> VmRecord {
        VmRecord {
            name: "dev-1".into(),
            box_image: "ubuntu/focal64".into(),
            cpus: 2,
            memory_mb: 2048,
            project_path: PathBuf::from("/srv/project"),
            sync_method: method,
            host_path: None,
            guest_path: None,
            exclude_patterns: vec![".git".into(), "node_modules".into()],
            ports: vec![PortForward { guest: 3000, host: 3000 }],
            environment: vec!["export APP_ENV=dev".into()],
            provisioners: Vec::new(),
        }
    }

    #[test]
    fn renders_box_resources_and_name() {
        let out = render(&record(SyncMethod::Rsync));
        assert!(out.contains("config.vm.box = \"ubuntu/focal64\""));
        assert!(out.contains("vb.name = \"dev-1\""));
        assert!(out.contains("vb.memory = 2048"));
        assert!(out.contains("vb.cpus = 2"));
    }

    #[test]
    fn renders_forwarded_ports_bound_to_localhost() {
        let out = render(&record(SyncMethod::Rsync));
        assert!(out.contains(
            "config.vm.network \"forwarded_port\", guest: 3000, host: 3000, host_ip: \"127.0.0.1\""
        ));
    }

    #[test]
    fn rsync_block_carries_excludes() {
        let out = render(&record(SyncMethod::Rsync));
        assert!(out.contains("type: \"rsync\""));
        assert!(out.contains("rsync__exclude: [\".git\", \"node_modules\"]"));
    }

    #[test]
    fn nfs_block_pins_version_four_tcp() {
        let out = render(&record(SyncMethod::Nfs));
        assert!(out.contains("type: \"nfs\""));
        assert!(out.contains("nfs_udp: false"));
        assert!(out.contains("nfs_version: 4"));
    }

    #[test]
    fn smb_block_is_minimal() {
        let out = render(&record(SyncMethod::Smb));
        assert!(out.contains("type: \"smb\""));
    }

    #[test]
    fn virtualbox_block_omits_type() {
        let out = render(&record(SyncMethod::VirtualBox));
        assert!(out.contains("config.vm.synced_folder \"/srv/project\", \"/vagrant\""));
        assert!(!out.contains("type:"));
    }

    #[test]
    fn environment_lines_land_in_provisioner() {
        let out = render(&record(SyncMethod::Rsync));
        assert!(out.contains("    export APP_ENV=dev\n"));
    }

    #[test]
    fn host_path_overrides_project_path() {
        let mut rec = record(SyncMethod::VirtualBox);
        rec.host_path = Some(PathBuf::from("/data/shared"));
        rec.guest_path = Some("/workspace".into());
        let out = render(&rec);
        assert!(out.contains("config.vm.synced_folder \"/data/shared\", \"/workspace\""));
    }
}
