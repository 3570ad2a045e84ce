//! Wire messages exchanged over the broker.

use serde::{Deserialize, Serialize};

use crate::job::{JobStatus, JobType};

/// Default queue carrying job requests
pub const JOB_QUEUE: &str = "jobs";

/// Default exchange carrying status changes
pub const STATUS_EXCHANGE: &str = "job_statuses";

/// Name of the exchange carrying a job's live log lines
#[must_use]
pub fn log_exchange(job_id: u64) -> String {
    format!("job_log_{job_id}")
}

/// A job request taken off the job queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Job ID
    pub id: u64,
    /// Job type tag, kept raw so unsupported types can be reported
    #[serde(rename = "type")]
    pub job_type: String,
}

impl JobMessage {
    /// Decodes a message body
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the body is not a job request.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// A status change broadcast on the status exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Job type tag
    #[serde(rename = "type")]
    pub job_type: String,
    /// Job ID
    pub id: u64,
    /// New status
    pub status: JobStatus,
}

impl StatusMessage {
    /// Creates a status message
    #[must_use]
    pub fn new(job_type: Option<JobType>, id: u64, status: JobStatus) -> Self {
        Self {
            job_type: job_type.map(|t| t.as_str().to_string()).unwrap_or_default(),
            id,
            status,
        }
    }

    /// Encodes the message body
    ///
    /// # Errors
    ///
    /// Returns the JSON error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
