//! Mapping of `vagrant status --machine-readable` output to a canonical
//! lifecycle state.
//!
//! The machine-readable format is line oriented: comma-separated fields of
//! the form `<timestamp>,<machine>,<kind>,<data>`. The only line kind this
//! orchestrator interprets is `state`.

use crate::error::{Result, SandboxError};
use crate::vm::VmState;

/// Parse machine-readable status output into a canonical state.
///
/// Only the first `state` line is honored. An unknown state token, the
/// absence of any state line, or empty input are all parse failures; the
/// caller decides whether to present those as Unknown or Error.
pub fn parse_machine_readable(output: &str) -> Result<VmState> {
    if output.trim().is_empty() {
        return Err(SandboxError::parse("vagrant status", "empty output"));
    }

    for line in output.lines() {
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 4 || fields[2] != "state" {
            continue;
        }
        // Mapping is exhaustive and case-sensitive.
        return match fields[3] {
            "running" => Ok(VmState::Running),
            "poweroff" | "aborted" => Ok(VmState::Stopped),
            "saved" => Ok(VmState::Suspended),
            "not_created" => Ok(VmState::NotCreated),
            other => Err(SandboxError::parse(
                "vagrant status",
                format!("unknown state token '{}'", other),
            )),
        };
    }

    Err(SandboxError::parse(
        "vagrant status",
        "no state line in output",
    ))
}
