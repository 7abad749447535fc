//! Shared test support: a scripted [`Invoker`] so lifecycle, sync, and
//! executor logic can be exercised without vagrant, rsync, or ssh installed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;
use crate::process::{CommandResult, InvokeRequest, Invoker};

type Handler = dyn Fn(&InvokeRequest) -> Result<CommandResult> + Send + Sync;

/// An invoker that answers from a handler closure and records every request.
pub(crate) struct ScriptedInvoker {
    calls: Mutex<Vec<InvokeRequest>>,
    handler: Box<Handler>,
}

impl ScriptedInvoker {
    pub fn new(
        handler: impl Fn(&InvokeRequest) -> Result<CommandResult> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    /// All requests seen so far, in invocation order.
    pub fn calls(&self) -> Vec<InvokeRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(&self, req: InvokeRequest) -> Result<CommandResult> {
        self.calls.lock().unwrap().push(req.clone());
        (self.handler)(&req)
    }
}

/// A zero-exit result carrying the given stdout.
pub(crate) fn ok_with_stdout(stdout: &str) -> CommandResult {
    result_with(0, stdout, "")
}

/// A nonzero-exit result carrying the given stderr.
pub(crate) fn failure(exit_code: i32, stderr: &str) -> CommandResult {
    result_with(exit_code, "", stderr)
}

pub(crate) fn result_with(exit_code: i32, stdout: &str, stderr: &str) -> CommandResult {
    let now = Utc::now();
    CommandResult {
        command: "scripted".into(),
        args: Vec::new(),
        exit_code,
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        error: None,
        started_at: now,
        finished_at: now,
        duration: Duration::from_millis(1),
    }
}
