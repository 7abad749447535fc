pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rmcp::transport::io::stdio;
use rmcp::ServiceExt;
use tracing::info;

use crate::config::Config;
use crate::exec::Executor;
use crate::sync::SyncEngine;
use crate::vm::VmManager;

use self::tools::SandboxServer;

/// Start the MCP server on stdio transport. Each inbound tool call runs on
/// its own task; the orchestrator components behind the server are shared
/// by reference.
pub async fn serve(
    config: &Config,
    vms: Arc<VmManager>,
    sync: Arc<SyncEngine>,
    executor: Arc<Executor>,
) -> Result<()> {
    let session_id = uuid::Uuid::new_v4().to_string();

    let server = SandboxServer::new(
        vms,
        sync,
        executor,
        config.defaults.clone(),
        Duration::from_secs(config.exec.default_timeout_secs),
    );

    info!(session = %session_id, "starting MCP server on stdio");
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
