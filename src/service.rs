//! Worker service wiring.
//!
//! Three long-running roles share one broker URI:
//!
//! - the subscriber consumes the job queue and acknowledges a job once the
//!   dispatcher took it;
//! - the dispatcher runs one job at a time;
//! - the status publisher forwards status events to the status exchange.
//!
//! Shutdown cancels the dispatcher. Dropping its channel ends the subscriber,
//! and dropping its status sender lets the status publisher drain and stop.

use anyhow::{Context, bail};
use shipwright_broker::{
    AmqpConnector, BrokerResult, QueuedSubscriber, ReliablePublisher, SessionFactory, bus,
};
use shipwright_core::JobRepository;
use shipwright_executor::{GitCli, RepositorySync, StorageLayout};
use shipwright_infrastructure::{HttpWebhookSender, PgJobRepository, SmtpMailer};
use shipwright_worker::{Dispatcher, Notifier, StatusPublisher};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::infrastructure::WorkerSettings;

/// Time the status publisher gets to drain once the dispatcher stopped
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const SUBSCRIBER: &str = "subscriber";
const DISPATCHER: &str = "dispatcher";
const STATUS_PUBLISHER: &str = "status publisher";

type RoleResult = (&'static str, anyhow::Result<()>);

/// Runs the worker until interrupted or until a role stops
///
/// # Errors
///
/// Returns an error when startup fails or when any role ended with an error.
pub async fn run(settings: WorkerSettings) -> anyhow::Result<()> {
    let storage = settings
        .storage_root()
        .context("cannot resolve the storage directory")?;
    let repo = PgJobRepository::connect(&settings.database_url)
        .await
        .context("cannot connect to the job store")?;
    let repo: Arc<dyn JobRepository> = Arc::new(repo);
    let notifier = notifier(&settings)?;

    let connector = AmqpConnector::new(settings.amqp_url.clone());
    let policy = settings.dial_policy();

    let shutdown = CancellationToken::new();
    let stop = shutdown.child_token();
    let (jobs_tx, jobs_rx) = bus::rendezvous();
    let (status_tx, status_rx) = bus::single_slot();

    let mut roles: JoinSet<RoleResult> = JoinSet::new();

    let sessions = SessionFactory::new(connector.clone(), policy).spawn(stop.child_token());
    let subscriber = QueuedSubscriber::new(settings.job_queue.clone());
    roles.spawn(async move { (SUBSCRIBER, role(subscriber.run(sessions, jobs_tx).await)) });

    let sessions = SessionFactory::new(connector.clone(), policy).spawn(shutdown.child_token());
    let publisher = ReliablePublisher::new(settings.status_exchange.clone());
    roles.spawn(async move { (STATUS_PUBLISHER, role(publisher.run(sessions, status_rx).await)) });

    let sync = RepositorySync::new(GitCli::default(), StorageLayout::new(storage));
    let dispatcher = Dispatcher::new(
        repo,
        connector,
        StatusPublisher::new(status_tx),
        sync,
        stop.clone(),
    )
    .with_dial_policy(policy)
    .with_playbook_command(settings.playbook_command.clone())
    .with_notifier(notifier);
    roles.spawn(async move {
        dispatcher.run(jobs_rx).await;
        (DISPATCHER, Ok(()))
    });

    tokio::spawn(watch_signals(stop.clone()));
    info!(
        queue = %settings.job_queue,
        exchange = %settings.status_exchange,
        "worker started"
    );

    let failed = supervise(&mut roles, &stop, &shutdown).await;
    if failed.is_empty() {
        info!("worker stopped");
        Ok(())
    } else {
        bail!("worker stopped after failures in: {}", failed.join(", "))
    }
}

fn notifier(settings: &WorkerSettings) -> anyhow::Result<Notifier> {
    let mailer = SmtpMailer::new(&settings.smtp).context("invalid mail settings")?;
    let webhooks =
        HttpWebhookSender::new(settings.webhook_timeout()).context("cannot build the webhook client")?;
    Ok(Notifier::new()
        .with_mail(Arc::new(mailer))
        .with_webhooks(Arc::new(webhooks)))
}

fn role(result: BrokerResult<()>) -> anyhow::Result<()> {
    result.map_err(anyhow::Error::from)
}

/// Joins every role and returns the names of those that failed
///
/// The first role to stop cancels `stop`. `shutdown` is the parent of every
/// token and fires once the status publisher drained or ran out of time.
async fn supervise(
    roles: &mut JoinSet<RoleResult>,
    stop: &CancellationToken,
    shutdown: &CancellationToken,
) -> Vec<&'static str> {
    let mut failed = Vec::new();
    let mut deadline: Option<Instant> = None;

    while !roles.is_empty() {
        let joined = match deadline {
            Some(at) => match tokio::time::timeout_at(at, roles.join_next()).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("roles did not stop within {SHUTDOWN_GRACE:?}, aborting");
                    shutdown.cancel();
                    roles.abort_all();
                    deadline = None;
                    continue;
                }
            },
            None => roles.join_next().await,
        };
        let Some(joined) = joined else {
            break;
        };

        match joined {
            Ok((name, Ok(()))) => {
                info!(role = name, "role stopped");
                if name == DISPATCHER {
                    deadline = Some(Instant::now() + SHUTDOWN_GRACE);
                }
            }
            Ok((name, Err(err))) => {
                error!(role = name, error = %err, "role failed");
                failed.push(name);
                if name == DISPATCHER {
                    deadline = Some(Instant::now() + SHUTDOWN_GRACE);
                }
            }
            Err(err) if err.is_cancelled() => warn!("role aborted"),
            Err(err) => {
                error!(error = %err, "role panicked");
                failed.push("panicked role");
            }
        }
        if !stop.is_cancelled() {
            info!("shutting down");
            stop.cancel();
        }
    }
    shutdown.cancel();
    failed
}

async fn watch_signals(stop: CancellationToken) {
    tokio::select! {
        () = stop.cancelled() => return,
        () = shutdown_signal() => info!("shutdown signal received"),
    }
    stop.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
