use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tarpc::{client, context, tokio_serde::formats::Json};
use tokio::{sync::oneshot, task::JoinHandle};

use crate::error::{Error, Result};
use crate::task::{Job, Task};

/// tarpc attaches a 10s deadline to every request by default. Tasks are not
/// timed out, so dispatches carry a deadline far beyond any realistic task.
pub const DISPATCH_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// Asynchronous handle of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub done: bool,
    /// First failure of the job, set together with `done`.
    pub error: Option<Error>,
}

impl Operation {
    pub(crate) fn pending(id: String) -> Self {
        Operation {
            id,
            done: false,
            error: None,
        }
    }
}

#[tarpc::service]
pub trait MasterService {
    /// Appends a worker endpoint to the round-robin pool.
    async fn register(worker: String);
    /// Starts a job in the background and returns its operation right away.
    async fn submit_job(job: Job, distributed: bool) -> Result<Operation>;
    async fn get_operation(id: String) -> Result<Operation>;
}

#[tarpc::service]
pub trait WorkerService {
    /// Runs one task to completion.
    async fn do_task(task: Task) -> Result<()>;
}

pub fn dispatch_context() -> context::Context {
    let mut ctx = context::current();
    ctx.deadline = Instant::now() + DISPATCH_DEADLINE;
    ctx
}

pub async fn connect_master(address: &str) -> Result<MasterServiceClient> {
    let mut transport = tarpc::serde_transport::unix::connect(address, Json::default);
    transport.config_mut().max_frame_length(usize::MAX);
    let transport = transport
        .await
        .map_err(|err| Error::Transport(format!("dialing master {address}: {err}")))?;
    Ok(MasterServiceClient::new(client::Config::default(), transport).spawn())
}

pub async fn connect_worker(address: &str) -> Result<WorkerServiceClient> {
    let mut transport = tarpc::serde_transport::unix::connect(address, Json::default);
    transport.config_mut().max_frame_length(usize::MAX);
    let transport = transport
        .await
        .map_err(|err| Error::Transport(format!("dialing worker {address}: {err}")))?;
    Ok(WorkerServiceClient::new(client::Config::default(), transport).spawn())
}

/// A running accept loop bound to a unix socket.
#[derive(Debug)]
pub struct ServerHandle {
    address: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub(crate) fn new(address: String, shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        ServerHandle {
            address,
            shutdown,
            task,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stops accepting connections and removes the socket file. Connections
    /// that are already open keep being served, so calls in flight still
    /// get their reply.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        // the accept loop may already be gone
        let _ = self.shutdown.send(());
        self.task
            .await
            .with_context(|| format!("server {} did not stop cleanly", self.address))?;
        remove_socket(&self.address)
    }
}

/// Socket paths are reused between runs; a stale file makes bind fail.
pub(crate) fn remove_socket(address: &str) -> anyhow::Result<()> {
    let path = Path::new(address);
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("removing socket {address}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_context_outlives_default_deadline() {
        let ctx = dispatch_context();
        assert!(ctx.deadline > Instant::now() + Duration::from_secs(60 * 60));
    }

    #[test]
    fn test_operation_starts_pending() {
        let op = Operation::pending("abc".to_string());
        assert_eq!(op.id, "abc");
        assert!(!op.done);
        assert_eq!(op.error, None);
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_is_transport_error() {
        let result = connect_worker("/tmp/mr-no-such-worker-socket").await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
