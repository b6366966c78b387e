//! The durable store for printers and jobs.
//!
//! Every record carries a version. Writes name the version they were based
//! on and a commit applies all of its writes or none of them, so two tasks
//! racing on the same record cannot both win.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    error::{Error, Result},
    job::{Job, JobId, NewJob},
    printer::{Printer, Serial},
};

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// Incremented by every committed write.
    pub version: u64,
    /// The record.
    pub record: T,
}

/// One conditional write.
#[derive(Debug, Clone)]
pub enum Write {
    /// Replace a printer, if it is still at `expected`.
    Printer {
        /// The version the change was based on.
        expected: u64,
        /// The new record.
        record: Printer,
    },
    /// Replace a job, if it is still at `expected`.
    Job {
        /// The version the change was based on.
        expected: u64,
        /// The new record.
        record: Job,
    },
}

impl Write {
    /// A write replacing `current` with `record`.
    pub fn printer(current: &Versioned<Printer>, record: Printer) -> Self {
        Write::Printer {
            expected: current.version,
            record,
        }
    }

    /// A write replacing `current` with `record`.
    pub fn job(current: &Versioned<Job>, record: Job) -> Self {
        Write::Job {
            expected: current.version,
            record,
        }
    }
}

/// The durable store.
#[async_trait]
pub trait Store: Send + Sync {
    /// All printers.
    async fn printers(&self) -> Result<Vec<Versioned<Printer>>>;

    /// One printer.
    async fn printer(&self, serial: &Serial) -> Result<Versioned<Printer>>;

    /// All jobs.
    async fn jobs(&self) -> Result<Vec<Versioned<Job>>>;

    /// One job.
    async fn job(&self, id: JobId) -> Result<Versioned<Job>>;

    /// Register a printer. Fails if the serial is taken.
    async fn insert_printer(&self, printer: Printer) -> Result<Versioned<Printer>>;

    /// Store a new pending job and give it an id.
    async fn create_job(&self, job: NewJob) -> Result<Versioned<Job>>;

    /// Apply every write, or none of them when any record has moved on.
    ///
    /// Returns [`Error::ConcurrentAssignmentConflict`] on a version mismatch.
    async fn commit(&self, writes: Vec<Write>) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    printers: BTreeMap<Serial, Versioned<Printer>>,
    jobs: BTreeMap<JobId, Versioned<Job>>,
    next_job_id: u64,
}

/// A [`Store`] held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn printers(&self) -> Result<Vec<Versioned<Printer>>> {
        Ok(self.tables.read().await.printers.values().cloned().collect())
    }

    async fn printer(&self, serial: &Serial) -> Result<Versioned<Printer>> {
        self.tables
            .read()
            .await
            .printers
            .get(serial)
            .cloned()
            .ok_or_else(|| Error::PrinterNotFound(serial.clone()))
    }

    async fn jobs(&self) -> Result<Vec<Versioned<Job>>> {
        Ok(self.tables.read().await.jobs.values().cloned().collect())
    }

    async fn job(&self, id: JobId) -> Result<Versioned<Job>> {
        self.tables
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or(Error::JobNotFound(id))
    }

    async fn insert_printer(&self, printer: Printer) -> Result<Versioned<Printer>> {
        let mut tables = self.tables.write().await;
        if tables.printers.contains_key(&printer.serial) {
            return Err(Error::Store(format!("printer {} already exists", printer.serial)));
        }
        let versioned = Versioned {
            version: 1,
            record: printer,
        };
        tables.printers.insert(versioned.record.serial.clone(), versioned.clone());
        Ok(versioned)
    }

    async fn create_job(&self, job: NewJob) -> Result<Versioned<Job>> {
        let mut tables = self.tables.write().await;
        tables.next_job_id += 1;
        let id = JobId(tables.next_job_id);
        let versioned = Versioned {
            version: 1,
            record: Job::from_new(id, job, Utc::now()),
        };
        tables.jobs.insert(id, versioned.clone());
        Ok(versioned)
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        let mut tables = self.tables.write().await;

        for write in &writes {
            let (found, expected, what) = match write {
                Write::Printer { expected, record } => (
                    tables.printers.get(&record.serial).map(|p| p.version),
                    *expected,
                    format!("printer {}", record.serial),
                ),
                Write::Job { expected, record } => (
                    tables.jobs.get(&record.id).map(|j| j.version),
                    *expected,
                    format!("job {}", record.id),
                ),
            };
            match found {
                None => return Err(Error::Store(format!("{what} disappeared"))),
                Some(version) if version != expected => {
                    return Err(Error::ConcurrentAssignmentConflict(format!(
                        "{what} is at version {version}, write expected {expected}"
                    )))
                }
                Some(_) => {}
            }
        }

        for write in writes {
            match write {
                Write::Printer { expected, record } => {
                    tables.printers.insert(
                        record.serial.clone(),
                        Versioned {
                            version: expected + 1,
                            record,
                        },
                    );
                }
                Write::Job { expected, record } => {
                    tables.jobs.insert(
                        record.id,
                        Versioned {
                            version: expected + 1,
                            record,
                        },
                    );
                }
            }
        }

        Ok(())
    }
}
