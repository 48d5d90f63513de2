use std::time::Duration;

use anyhow::Context as _;
use tracing::info;

use crate::error::Result;
use crate::master::{random_token, Master};
use crate::processor::Processors;
use crate::rpc::{self, MasterServiceClient, Operation, ServerHandle};
use crate::worker::Worker;

/// One master and `n` workers in the current process, each on its own unix
/// socket under the system temp dir. Meant for tests and local runs.
pub struct Cluster {
    master: Master,
    master_server: ServerHandle,
    workers: Vec<ServerHandle>,
}

impl Cluster {
    pub async fn start(num_workers: usize, processors: Processors) -> anyhow::Result<Self> {
        let master = Master::new(socket_path("master"));
        let master_server = master.clone().start().await?;

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let worker = Worker::new(socket_path("worker"), master.address(), processors.clone());
            let handle = worker
                .start()
                .await
                .with_context(|| format!("starting worker {i}"))?;
            workers.push(handle);
        }
        info!(workers = num_workers, "cluster is ready");

        Ok(Cluster {
            master,
            master_server,
            workers,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.master.address()
    }

    pub fn master(&self) -> &Master {
        &self.master
    }

    pub fn worker_addresses(&self) -> Vec<&str> {
        self.workers.iter().map(ServerHandle::address).collect()
    }

    pub async fn connect(&self) -> Result<MasterServiceClient> {
        rpc::connect_master(self.endpoint()).await
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        for worker in self.workers {
            worker.shutdown().await?;
        }
        self.master_server.shutdown().await?;
        info!("cluster is shutdown");
        Ok(())
    }
}

fn socket_path(role: &str) -> String {
    let name = format!("mr-{role}-{}", random_token(5));
    std::env::temp_dir().join(name).display().to_string()
}

/// Polls the master every `interval` until the operation is done.
pub async fn wait_for_operation(
    client: &MasterServiceClient,
    id: &str,
    interval: Duration,
) -> Result<Operation> {
    loop {
        let operation = client
            .get_operation(tarpc::context::current(), id.to_string())
            .await??;
        if operation.done {
            return Ok(operation);
        }
        tokio::time::sleep(interval).await;
    }
}
