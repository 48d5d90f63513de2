use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use futures::{future, lock::Mutex, prelude::*, stream::FuturesUnordered};
use rand::Rng;
use tarpc::{
    context,
    server::{self, Channel},
    tokio_serde::formats::Json,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::rpc::{
    self, dispatch_context, MasterService, Operation, ServerHandle, WorkerServiceClient,
};
use crate::task::{Job, Task};

#[derive(Default)]
struct State {
    // registration order, duplicates kept
    workers: Vec<String>,
    // round-robin cursor into `workers`
    next: usize,
    clients: HashMap<String, WorkerServiceClient>,
    // operation id -> job
    jobs: HashMap<String, JobEntry>,
}

struct JobEntry {
    job: Job,
    operation: Operation,
}

/// The coordinator: worker pool, job table and job drivers.
///
/// Cloning is cheap; every clone shares the same state. The RPC server
/// hands one clone to each request.
#[derive(Clone)]
pub struct Master {
    address: String,
    state: Arc<Mutex<State>>,
}

impl Master {
    pub fn new(address: impl Into<String>) -> Self {
        Master {
            address: address.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn register_worker(&self, worker: String) {
        let mut state = self.state.lock().await;
        state.workers.push(worker);
        info!(workers = ?state.workers, "new worker joined");
    }

    pub async fn workers(&self) -> Vec<String> {
        self.state.lock().await.workers.clone()
    }

    /// Records the job and starts its driver. Returns before any task runs.
    pub async fn submit(&self, mut job: Job, distributed: bool) -> Result<Operation> {
        job.validate()?;
        let input_files = job.input_files()?;

        job.id = random_token(8);
        let operation = Operation::pending(random_token(32));
        info!(
            job = %job.id,
            operation = %operation.id,
            map_tasks = input_files.len(),
            reduce_tasks = job.r,
            distributed,
            "job submitted"
        );

        self.state.lock().await.jobs.insert(
            operation.id.clone(),
            JobEntry {
                job: job.clone(),
                operation: operation.clone(),
            },
        );

        let master = self.clone();
        let operation_id = operation.id.clone();
        tokio::spawn(async move {
            master.drive(operation_id, job, input_files, distributed).await;
        });

        Ok(operation)
    }

    /// Snapshot of an operation, finished or not.
    pub async fn operation(&self, id: &str) -> Result<Operation> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(id)
            .map(|entry| entry.operation.clone())
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    pub async fn job(&self, operation_id: &str) -> Result<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(operation_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| Error::OperationNotFound(operation_id.to_string()))
    }

    #[tracing::instrument(name = "job", skip_all, fields(job = %job.id))]
    async fn drive(self, operation_id: String, job: Job, input_files: Vec<PathBuf>, distributed: bool) {
        let result = if distributed {
            self.distributed(&job, &input_files).await
        } else {
            self.sequential(&job, &input_files).await
        };

        let cleanup = job.remove_intermediate_files(input_files.len());
        let result = match (result, cleanup) {
            (Ok(()), cleanup) => cleanup,
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(cleanup_err)) => {
                warn!(error = %cleanup_err, "failed to remove intermediate files");
                Err(err)
            }
        };

        match &result {
            Ok(()) => info!("job done"),
            Err(err) => warn!(error = %err, "job failed"),
        }
        self.finish(&operation_id, result.err()).await;
    }

    /// Moves the operation to its terminal state.
    async fn finish(&self, operation_id: &str, error: Option<Error>) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.jobs.get_mut(operation_id) {
            entry.operation.done = true;
            entry.operation.error = error;
        }
    }

    /// Every task of the job, one at a time, on a single worker.
    async fn sequential(&self, job: &Job, input_files: &[PathBuf]) -> Result<()> {
        let client = self.client().await?;

        for task in job.map_tasks(input_files) {
            dispatch(&client, task).await?;
        }
        info!("map phase done");

        for task in job.reduce_tasks(input_files.len()) {
            dispatch(&client, task).await?;
        }
        info!("reduce phase done");
        Ok(())
    }

    /// Fans each phase out over the pool; the reduce phase only starts once
    /// every map dispatch has returned.
    async fn distributed(&self, job: &Job, input_files: &[PathBuf]) -> Result<()> {
        self.phase(job.map_tasks(input_files)).await?;
        info!("map phase done");

        self.phase(job.reduce_tasks(input_files.len())).await?;
        info!("reduce phase done");
        Ok(())
    }

    /// Dispatches all tasks concurrently and waits for every one of them.
    /// The first failure to come back is the phase's result.
    async fn phase(&self, tasks: Vec<Task>) -> Result<()> {
        let mut first_error = None;
        let mut pending = FuturesUnordered::new();

        for task in tasks {
            let client = match self.client().await {
                Ok(client) => client,
                Err(err) => {
                    first_error = Some(err);
                    break;
                }
            };
            pending.push(tokio::spawn(async move { dispatch(&client, task).await }));
        }

        while let Some(joined) = pending.next().await {
            let outcome = joined
                .map_err(|err| Error::Processing(format!("dispatch aborted: {err}")))
                .and_then(|result| result);
            if let Err(err) = outcome {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    warn!(error = %err, "additional task failure dropped");
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Next worker in round-robin order.
    pub async fn next_worker(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.workers.is_empty() {
            return Err(Error::NoWorkers);
        }
        let worker = state.workers[state.next].clone();
        state.next = (state.next + 1) % state.workers.len();
        Ok(worker)
    }

    /// Client for the next worker, dialed on first use and cached for the
    /// master's lifetime.
    async fn client(&self) -> Result<WorkerServiceClient> {
        let worker = self.next_worker().await?;
        if let Some(client) = self.state.lock().await.clients.get(&worker) {
            return Ok(client.clone());
        }

        let client = rpc::connect_worker(&worker).await?;
        let mut state = self.state.lock().await;
        // a concurrent dispatch may have dialed the same worker meanwhile
        Ok(state.clients.entry(worker).or_insert(client).clone())
    }

    /// Binds the master's socket and serves RPCs until the handle is shut
    /// down. Cached worker connections are dropped on the way out.
    #[tracing::instrument(name = "master", skip_all, fields(address = %self.address))]
    pub async fn start(self) -> anyhow::Result<ServerHandle> {
        rpc::remove_socket(&self.address)?;
        let mut listener =
            tarpc::serde_transport::unix::listen(&self.address, Json::default).await?;
        listener.config_mut().max_frame_length(usize::MAX);
        info!("master node starts listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let master = self.clone();
        let server_future = listener
            // Ignore accept errors.
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .for_each(move |channel| {
                // outlives the accept loop
                tokio::spawn(
                    channel
                        .execute(MasterService::serve(master.clone()))
                        .for_each(spawn),
                );
                future::ready(())
            });

        let master = self.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = server_future => {},
                _ = shutdown_rx => info!("master received shutdown signal"),
            }
            for (worker, _) in master.state.lock().await.clients.drain() {
                debug!(%worker, "closing worker connection");
            }
            info!("master node exits");
        });

        Ok(ServerHandle::new(self.address, shutdown_tx, task))
    }
}

impl MasterService for Master {
    async fn register(self, _: context::Context, worker: String) {
        self.register_worker(worker).await;
    }

    async fn submit_job(self, _: context::Context, job: Job, distributed: bool) -> Result<Operation> {
        self.submit(job, distributed).await
    }

    async fn get_operation(self, _: context::Context, id: String) -> Result<Operation> {
        self.operation(&id).await
    }
}

async fn dispatch(client: &WorkerServiceClient, task: Task) -> Result<()> {
    let (kind, id) = (task.kind(), task.id());
    debug!(%kind, id, "dispatching task");
    let result = client
        .do_task(dispatch_context(), task)
        .await
        .map_err(Error::from)
        .and_then(|result| result);
    if let Err(err) = &result {
        warn!(%kind, id, error = %err, "task failed");
    }
    result
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

/// `size` random bytes, hex encoded.
pub(crate) fn random_token(size: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..size).fold(String::with_capacity(size * 2), |mut token, _| {
        let _ = write!(token, "{:02x}", rng.gen::<u8>());
        token
    })
}
