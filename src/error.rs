use thiserror::Error;

use crate::vm::VmState;

/// Crate-wide result alias.
pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

/// Error taxonomy for all orchestrator operations.
///
/// Every failure carries the operation it belongs to; callers (the MCP tool
/// layer, the CLI) decide how to present it. There is no retry logic anywhere
/// in the orchestrator, so an error always means the single attempt failed.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A VM record, VM directory, source path, or conflict entry is absent.
    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    /// An external invocation returned failure or a local I/O step failed.
    /// The alternate formatting walks the full cause chain.
    #[error("operation '{op}' failed: {cause:#}")]
    OperationFailed {
        op: &'static str,
        cause: anyhow::Error,
    },

    /// The operation requires a running VM and the VM is in another state.
    #[error("VM '{vm}' is not running (state: {state})")]
    InvalidState { vm: String, state: VmState },

    /// Status or connection-info output could not be parsed.
    #[error("could not parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    /// A sync method or conflict resolution outside the closed enumeration.
    #[error("unsupported {what}: '{value}'")]
    Unsupported { what: &'static str, value: String },
}

impl SandboxError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { what, id: id.into() }
    }

    pub fn operation_failed(op: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        Self::OperationFailed { op, cause: cause.into() }
    }

    /// Operation failure described by captured process output rather than an
    /// underlying error value.
    pub fn operation_output(op: &'static str, output: impl AsRef<str>) -> Self {
        Self::OperationFailed {
            op,
            cause: anyhow::anyhow!("{}", output.as_ref().trim()),
        }
    }

    pub fn invalid_state(vm: impl Into<String>, state: VmState) -> Self {
        Self::InvalidState { vm: vm.into(), state }
    }

    pub fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Parse { what, detail: detail.into() }
    }

    pub fn unsupported(what: &'static str, value: impl Into<String>) -> Self {
        Self::Unsupported { what, value: value.into() }
    }
}
