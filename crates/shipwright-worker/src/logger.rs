//! Per-job log fanout.
//!
//! Every line a job produces is appended to the job log in the store and
//! published on the job's own log exchange. The live side runs a dedicated
//! reliable publisher with its own session factory for the lifetime of the
//! job; losing it never fails the job.

use async_trait::async_trait;
use shipwright_broker::{
    BrokerResult, Connector, DialPolicy, Message, ReliablePublisher, SessionFactory, bus,
};
use shipwright_core::{JobRepository, log_exchange};
use shipwright_executor::LineSink;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Log sink of one job
pub struct JobLogger {
    job_id: u64,
    repo: Arc<dyn JobRepository>,
    live: mpsc::Sender<Message>,
    live_lost: AtomicBool,
    ordering: Mutex<()>,
}

impl fmt::Debug for JobLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLogger")
            .field("job_id", &self.job_id)
            .field("live_lost", &self.live_lost.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JobLogger {
    /// Creates a sink persisting to `repo` and publishing into `live`
    pub fn new(job_id: u64, repo: Arc<dyn JobRepository>, live: mpsc::Sender<Message>) -> Self {
        Self {
            job_id,
            repo,
            live,
            live_lost: AtomicBool::new(false),
            ordering: Mutex::new(()),
        }
    }

    /// Job the lines belong to
    #[must_use]
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Publishes a line without persisting it
    ///
    /// Used when there is no stored job to attach the line to.
    pub async fn publish(&self, line: &str) {
        if self.live.send(line.as_bytes().to_vec()).await.is_err()
            && !self.live_lost.swap(true, Ordering::Relaxed)
        {
            warn!(
                job_id = self.job_id,
                "live log publisher stopped, lines are only persisted"
            );
        }
    }

    async fn persist(&self, line: &str) {
        if let Err(err) = self.repo.append_log(self.job_id, line).await {
            warn!(job_id = self.job_id, error = %err, "cannot persist log line");
        }
    }
}

#[async_trait]
impl LineSink for JobLogger {
    async fn line(&self, line: String) {
        // stdout and stderr scanners share the sink; store and stream must agree
        let _ordered = self.ordering.lock().await;
        debug!(job_id = self.job_id, "{line}");
        self.persist(&line).await;
        self.publish(&line).await;
    }
}

/// Live log publisher of one job
#[derive(Debug)]
pub struct LogFanout {
    job_id: u64,
    publisher: JoinHandle<BrokerResult<()>>,
    cancel: CancellationToken,
}

impl LogFanout {
    /// Starts a publisher on the job's log exchange
    ///
    /// The publisher is stopped by [`LogFanout::close`], or by `parent` on
    /// shutdown.
    pub fn open<C: Connector>(
        connector: C,
        policy: DialPolicy,
        parent: &CancellationToken,
        job_id: u64,
        repo: Arc<dyn JobRepository>,
    ) -> (Arc<JobLogger>, Self) {
        let cancel = parent.child_token();
        let sessions = SessionFactory::new(connector, policy).spawn(cancel.clone());
        let (live, inbound) = bus::single_slot();
        let publisher =
            tokio::spawn(ReliablePublisher::new(log_exchange(job_id)).run(sessions, inbound));

        let logger = Arc::new(JobLogger::new(job_id, repo, live));
        (
            logger,
            Self {
                job_id,
                publisher,
                cancel,
            },
        )
    }

    /// Flushes outstanding lines and stops the publisher
    pub async fn close(self, logger: Arc<JobLogger>) {
        if Arc::try_unwrap(logger).is_err() {
            warn!(
                job_id = self.job_id,
                "log sink still in use, dropping unpublished lines"
            );
            self.publisher.abort();
        }

        match self.publisher.await {
            Ok(Ok(())) => debug!(job_id = self.job_id, "log publisher finished"),
            Ok(Err(err)) => warn!(job_id = self.job_id, error = %err, "log publisher failed"),
            Err(err) if err.is_cancelled() => debug!(job_id = self.job_id, "log publisher aborted"),
            Err(err) => warn!(job_id = self.job_id, error = %err, "log publisher panicked"),
        }
        self.cancel.cancel();
    }
}
