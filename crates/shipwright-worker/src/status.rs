//! Status change events.

use shipwright_broker::Message;
use shipwright_core::{JobStatus, JobType, StatusMessage};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Sends status events to the status exchange publisher
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    outbound: mpsc::Sender<Message>,
}

impl StatusPublisher {
    /// Wraps the inbound channel of the status exchange publisher
    pub fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self { outbound }
    }

    /// Publishes one status change
    ///
    /// Waits while the publisher is busy with the previous event.
    pub async fn publish(&self, job_type: Option<JobType>, id: u64, status: JobStatus) {
        let body = match StatusMessage::new(job_type, id, status).encode() {
            Ok(body) => body,
            Err(err) => {
                error!(job_id = id, error = %err, "cannot encode status message");
                return;
            }
        };
        if self.outbound.send(body).await.is_err() {
            warn!(job_id = id, %status, "status publisher stopped, event dropped");
            return;
        }
        debug!(job_id = id, %status, "status event queued");
    }
}
