//! Split-apply-combine over a pool of worker processes.
//!
//! A [`Master`] hands out map and reduce tasks to registered [`Worker`]s over
//! tarpc on unix sockets. Map and reduce phases talk through intermediate
//! files in a shared working directory; clients follow a job through the
//! [`Operation`] returned by `SubmitJob`.

pub mod cluster;
pub mod error;
pub mod master;
pub mod processor;
pub mod rpc;
pub mod task;
pub mod worker;

pub use cluster::{wait_for_operation, Cluster};
pub use error::{Error, Result};
pub use master::Master;
pub use processor::{ihash, partition, KeyValue, MapReducer, Mapper, Processors, Reducer};
pub use rpc::{MasterServiceClient, Operation, WorkerServiceClient};
pub use task::{read_records, Job, MapTask, ReduceTask, Task, TaskKind};
pub use worker::Worker;
