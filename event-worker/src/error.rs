use event_common::pgqueue;
use thiserror::Error;

/// Errors of the worker loop. Failures of single events never get here:
/// they are counted in the job's `UpsertSummary`.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when executing a job")]
    DatabaseError(#[from] pgqueue::DatabaseError),
}
