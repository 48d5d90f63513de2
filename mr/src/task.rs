use std::fmt;
use std::fs::{self, File, Permissions};
use std::io::{self, BufReader, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::processor::{partition, KeyValue, MapReducer};

/// A client-submitted unit of work.
///
/// `id` is left empty by the client and assigned by the master on
/// submission; it namespaces every intermediate and output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Name the worker resolves against its processor registry.
    pub processor: String,
    /// Number of reduce tasks.
    pub r: usize,
    /// Shared directory intermediate files are written to.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Job {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        processor: impl Into<String>,
        r: usize,
    ) -> Self {
        Job {
            id: String::new(),
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            processor: processor.into(),
            r,
            work_dir: default_work_dir(),
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn intermediate_file(&self, map_task: usize, reduce_task: usize) -> PathBuf {
        self.work_dir
            .join(intermediate_name(&self.id, map_task, reduce_task))
    }

    pub fn output_file(&self, reduce_task: usize) -> PathBuf {
        self.output_dir.join(output_name(&self.id, reduce_task))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.r < 1 {
            return Err(Error::InvalidJob(format!(
                "number of reduce tasks must be at least 1, got {}",
                self.r
            )));
        }
        if self.processor.is_empty() {
            return Err(Error::InvalidJob("processor name is empty".to_string()));
        }
        Ok(())
    }

    /// Regular files of `input_dir`, sorted by path. Taken once per job.
    pub(crate) fn input_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.input_dir).map_err(io_at(&self.input_dir))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    pub(crate) fn map_tasks(&self, input_files: &[PathBuf]) -> Vec<Task> {
        input_files
            .iter()
            .enumerate()
            .map(|(id, input_file)| {
                Task::Map(MapTask {
                    id,
                    input_file: input_file.clone(),
                    job: self.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn reduce_tasks(&self, map_tasks: usize) -> Vec<Task> {
        (0..self.r)
            .map(|id| {
                Task::Reduce(ReduceTask {
                    id,
                    map_tasks,
                    job: self.clone(),
                })
            })
            .collect()
    }

    /// Removes every intermediate file of the job, skipping ones that are
    /// already gone.
    pub(crate) fn remove_intermediate_files(&self, map_tasks: usize) -> Result<()> {
        for m in 0..map_tasks {
            for r in 0..self.r {
                let path = self.intermediate_file(m, r);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(io_at(&path)(err)),
                }
            }
        }
        Ok(())
    }
}

/// Maps one input file into `R` intermediate files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapTask {
    pub id: usize,
    pub input_file: PathBuf,
    pub job: Job,
}

impl MapTask {
    pub fn run(&self, processor: &dyn MapReducer) -> Result<()> {
        let data = fs::read(&self.input_file).map_err(io_at(&self.input_file))?;
        let kvs = processor.map(&data).map_err(|err| {
            Error::processing(err.context(format!("mapping {}", self.input_file.display())))
        })?;

        let r = self.job.r;
        let mut writers = (0..r)
            .map(|i| {
                let path = self.job.intermediate_file(self.id, i);
                let file = File::create(&path).map_err(io_at(&path))?;
                Ok(BufWriter::new(file))
            })
            .collect::<Result<Vec<_>>>()?;

        for kv in &kvs {
            write_record(&mut writers[partition(&kv.key, r)], kv)?;
        }
        for writer in &mut writers {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Shuffles, sorts, groups and reduces one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceTask {
    pub id: usize,
    /// Number of map tasks of the job, i.e. how many files to shuffle.
    pub map_tasks: usize,
    pub job: Job,
}

impl ReduceTask {
    pub fn run(&self, processor: &dyn MapReducer) -> Result<()> {
        let mut kvs = self.shuffle()?;
        // stable: equal keys keep their shuffle order
        kvs.sort_by(|a, b| a.key.cmp(&b.key));

        let mut reduced = Vec::new();
        let groups = kvs.into_iter().chunk_by(|kv| kv.key.clone());
        for (key, group) in &groups {
            let values: Vec<String> = group.map(|kv| kv.value).collect();
            let value = processor.reduce(&key, &values).map_err(|err| {
                Error::processing(err.context(format!("reducing key {key:?}")))
            })?;
            reduced.push(KeyValue { key, value });
        }

        self.commit(&reduced)
    }

    fn shuffle(&self) -> Result<Vec<KeyValue>> {
        let mut kvs = Vec::new();
        for m in 0..self.map_tasks {
            kvs.extend(read_records(self.job.intermediate_file(m, self.id))?);
        }
        Ok(kvs)
    }

    /// Output only becomes visible once every record is on disk.
    fn commit(&self, reduced: &[KeyValue]) -> Result<()> {
        let dir = &self.job.output_dir;
        fs::create_dir_all(dir).map_err(io_at(dir))?;

        let mut staged = NamedTempFile::new_in(dir).map_err(io_at(dir))?;
        {
            let mut writer = BufWriter::new(staged.as_file_mut());
            for kv in reduced {
                write_record(&mut writer, kv)?;
            }
            writer.flush()?;
        }

        let target = self.job.output_file(self.id);
        staged
            .persist(&target)
            .map_err(|err| io_at(&target)(err.error))?;
        fs::set_permissions(&target, Permissions::from_mode(0o644)).map_err(io_at(&target))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Map,
    Reduce,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Map => write!(f, "map"),
            TaskKind::Reduce => write!(f, "reduce"),
        }
    }
}

/// What a worker is asked to execute in one `DoTask` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Map(MapTask),
    Reduce(ReduceTask),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Map(_) => TaskKind::Map,
            Task::Reduce(_) => TaskKind::Reduce,
        }
    }

    pub fn id(&self) -> usize {
        match self {
            Task::Map(task) => task.id,
            Task::Reduce(task) => task.id,
        }
    }

    pub fn job(&self) -> &Job {
        match self {
            Task::Map(task) => &task.job,
            Task::Reduce(task) => &task.job,
        }
    }

    pub fn run(&self, processor: &dyn MapReducer) -> Result<()> {
        match self {
            Task::Map(task) => task.run(processor),
            Task::Reduce(task) => task.run(processor),
        }
    }
}

pub fn intermediate_name(job_id: &str, map_task: usize, reduce_task: usize) -> String {
    format!("mrtmp.{job_id}-{map_task}-{reduce_task}")
}

pub fn output_name(job_id: &str, reduce_task: usize) -> String {
    format!("mr.reduce.{job_id}-{reduce_task}")
}

/// Decodes an intermediate or output file, one JSON record per line.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<KeyValue>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(io_at(path))?;
    serde_json::Deserializer::from_reader(BufReader::new(file))
        .into_iter::<KeyValue>()
        .map(|record| record.map_err(Error::from))
        .collect()
}

fn write_record<W: Write>(writer: &mut W, kv: &KeyValue) -> Result<()> {
    serde_json::to_writer(&mut *writer, kv)?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |err| Error::Io(format!("{}: {err}", path.display()))
}
