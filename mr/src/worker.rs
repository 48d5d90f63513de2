use std::sync::Arc;

use anyhow::Context as _;
use futures::{future, prelude::*};
use tarpc::{
    context,
    server::{self, Channel},
    tokio_serde::formats::Json,
};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::processor::Processors;
use crate::rpc::{self, ServerHandle, WorkerService};
use crate::task::Task;

/// Executes tasks on behalf of a master.
///
/// A worker keeps no state between calls. Concurrent `DoTask` calls run
/// concurrently and only share the filesystem.
#[derive(Clone)]
pub struct Worker {
    address: String,
    master: String,
    processors: Arc<Processors>,
}

impl std::fmt::Display for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker {{ address: {}, master: {} }}", self.address, self.master)
    }
}

impl Worker {
    pub fn new(address: impl Into<String>, master: impl Into<String>, processors: Processors) -> Self {
        Worker {
            address: address.into(),
            master: master.into(),
            processors: Arc::new(processors),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Runs `task` to completion on the blocking pool.
    pub async fn execute(&self, task: Task) -> Result<()> {
        info!(worker = %self.address, kind = %task.kind(), id = task.id(), "start doing task");
        task.job().validate()?;
        let processor = self.processors.get(&task.job().processor)?;
        tokio::task::spawn_blocking(move || task.run(processor.as_ref()))
            .await
            .map_err(|err| Error::Processing(format!("task aborted: {err}")))?
    }

    async fn register(&self) -> Result<()> {
        let client = rpc::connect_master(&self.master).await?;
        client
            .register(context::current(), self.address.clone())
            .await?;
        Ok(())
    }

    /// Binds the worker's socket, starts serving and registers with the
    /// master. A master that cannot be reached fails the start.
    #[tracing::instrument(name = "worker", skip_all, fields(address = %self.address))]
    pub async fn start(self) -> anyhow::Result<ServerHandle> {
        rpc::remove_socket(&self.address)?;
        let mut listener =
            tarpc::serde_transport::unix::listen(&self.address, Json::default).await?;
        listener.config_mut().max_frame_length(usize::MAX);
        info!("worker node starts listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let worker = self.clone();
        // connections outlive the accept loop
        let server_future = listener
            // Ignore accept errors.
            .filter_map(|r| future::ready(r.ok()))
            .map(server::BaseChannel::with_defaults)
            .for_each(move |channel| {
                tokio::spawn(
                    channel
                        .execute(WorkerService::serve(worker.clone()))
                        .for_each(spawn),
                );
                future::ready(())
            });

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = server_future => {},
                _ = shutdown_rx => info!("worker received shutdown signal"),
            }
            info!("worker node exits");
        });
        let handle = ServerHandle::new(self.address.clone(), shutdown_tx, task);

        if let Err(err) = self.register().await {
            handle.shutdown().await?;
            return Err(err).with_context(|| format!("registering with master {}", self.master));
        }
        info!(master = %self.master, "registered with master");
        Ok(handle)
    }
}

impl WorkerService for Worker {
    async fn do_task(self, _: context::Context, task: Task) -> Result<()> {
        let (kind, id) = (task.kind(), task.id());
        let result = self.execute(task).await;
        if let Err(err) = &result {
            warn!(worker = %self.address, %kind, id, error = %err, "task failed");
        }
        result
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::processor::{KeyValue, Mapper, Reducer};
    use crate::task::{read_records, Job, MapTask, ReduceTask};

    struct Count;

    impl Mapper for Count {
        fn map(&self, data: &[u8]) -> anyhow::Result<Vec<KeyValue>> {
            Ok(String::from_utf8_lossy(data)
                .split_whitespace()
                .map(|w| KeyValue::new(w, "1"))
                .collect())
        }
    }

    impl Reducer for Count {
        fn reduce(&self, _key: &str, values: &[String]) -> anyhow::Result<String> {
            Ok(values.len().to_string())
        }
    }

    fn worker() -> Worker {
        Worker::new("/tmp/unused-worker", "/tmp/unused-master", Processors::new().with("wc", Count))
    }

    #[tokio::test]
    async fn test_execute_map_then_reduce() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "the cat the").unwrap();
        let mut job = Job::new(dir.path(), dir.path().join("out"), "wc", 1).with_work_dir(dir.path());
        job.id = "w1".to_string();

        let worker = worker();
        worker
            .execute(Task::Map(MapTask {
                id: 0,
                input_file: input,
                job: job.clone(),
            }))
            .await
            .unwrap();
        worker
            .execute(Task::Reduce(ReduceTask {
                id: 0,
                map_tasks: 1,
                job: job.clone(),
            }))
            .await
            .unwrap();

        assert_eq!(
            read_records(job.output_file(0)).unwrap(),
            vec![KeyValue::new("cat", "1"), KeyValue::new("the", "2")]
        );
    }

    #[tokio::test]
    async fn test_execute_unknown_processor() {
        let job = Job::new("in", "out", "grep", 1);
        let task = Task::Reduce(ReduceTask {
            id: 0,
            map_tasks: 0,
            job,
        });
        assert_eq!(
            worker().execute(task).await,
            Err(Error::UnknownProcessor("grep".to_string()))
        );
    }

    #[tokio::test]
    async fn test_execute_rejects_zero_partitions() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "the cat").unwrap();
        let job = Job::new(dir.path(), dir.path(), "wc", 0).with_work_dir(dir.path());

        let result = worker()
            .execute(Task::Map(MapTask {
                id: 0,
                input_file: input,
                job,
            }))
            .await;
        assert!(matches!(result, Err(Error::InvalidJob(_))));
    }

    #[tokio::test]
    async fn test_start_fails_without_master() {
        let dir = TempDir::new().unwrap();
        let address = dir.path().join("worker.sock").display().to_string();
        let master = dir.path().join("master.sock").display().to_string();

        let worker = Worker::new(address.clone(), master, Processors::new());
        assert!(worker.start().await.is_err());
        assert!(!std::path::Path::new(&address).exists());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            worker().to_string(),
            "Worker { address: /tmp/unused-worker, master: /tmp/unused-master }"
        );
    }
}
