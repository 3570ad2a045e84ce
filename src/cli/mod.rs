//! Command-line arguments
//!
//! Every option can also come from the environment, which is how the worker
//! is usually configured. A `.env` file in the working directory is loaded
//! first.

use anyhow::{Context, Result};
use clap::Parser;
use shipwright::infrastructure::{WorkerSettings, init_logging};
use shipwright_infrastructure::SmtpSettings;
use std::path::PathBuf;

/// CLI arguments for shipwright
#[derive(Parser, Debug)]
#[command(name = "shipwright")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker URI
    #[arg(long, env = "AMQP_URL")]
    amqp_url: String,

    /// Job store URI
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Root of repository checkouts and key files
    #[arg(long, env = "STORAGE_DIR", default_value = "storage")]
    storage_dir: PathBuf,

    /// Queue carrying job requests
    #[arg(long, env = "JOB_QUEUE", default_value = shipwright_core::JOB_QUEUE)]
    job_queue: String,

    /// Exchange receiving status events
    #[arg(long, env = "STATUS_EXCHANGE", default_value = shipwright_core::STATUS_EXCHANGE)]
    status_exchange: String,

    /// Automation command run by `job` and `deployment` jobs
    #[arg(long, env = "PLAYBOOK_COMMAND", default_value = "ansible-playbook")]
    playbook_command: String,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Broker dial attempts before giving up
    #[arg(long, env = "DIAL_ATTEMPTS", default_value_t = 1)]
    dial_attempts: u32,

    /// Pause between broker dial attempts, in milliseconds
    #[arg(long, env = "DIAL_RETRY_DELAY_MS", default_value_t = 1000)]
    dial_retry_delay_ms: u64,

    /// Webhook request timeout, in seconds
    #[arg(long, env = "WEBHOOK_TIMEOUT_SECS", default_value_t = 10)]
    webhook_timeout_secs: u64,

    /// Mail relay host
    #[arg(long, env = "SMTP_HOST", default_value = "localhost")]
    smtp_host: String,

    /// Mail relay port
    #[arg(long, env = "SMTP_PORT", default_value_t = 1025)]
    smtp_port: u16,

    /// Sender address of notification mails
    #[arg(long, env = "SMTP_SENDER", default_value = "noreply@shipwright.local")]
    smtp_sender: String,

    /// Mail relay user
    #[arg(long, env = "SMTP_USERNAME")]
    smtp_username: Option<String>,

    /// Mail relay password
    #[arg(long, env = "SMTP_PASSWORD", hide_env_values = true)]
    smtp_password: Option<String>,
}

impl From<Args> for WorkerSettings {
    fn from(args: Args) -> Self {
        Self {
            amqp_url: args.amqp_url,
            database_url: args.database_url,
            storage_dir: args.storage_dir,
            job_queue: args.job_queue,
            status_exchange: args.status_exchange,
            playbook_command: args.playbook_command,
            log_level: args.log_level,
            dial_attempts: args.dial_attempts,
            dial_retry_delay_ms: args.dial_retry_delay_ms,
            webhook_timeout_secs: args.webhook_timeout_secs,
            smtp: SmtpSettings {
                host: args.smtp_host,
                port: args.smtp_port,
                sender: args.smtp_sender,
                username: args.smtp_username,
                password: args.smtp_password,
            },
        }
    }
}

/// Parses arguments and runs the worker to completion
pub fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let settings = WorkerSettings::from(Args::parse());
    init_logging(&settings.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;
    runtime.block_on(shipwright::service::run(settings))
}
