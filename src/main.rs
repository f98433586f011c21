//! Leased Jobs - demo job host
//!
//! Wires the lock store, scheduler and sample jobs together and runs until
//! interrupted.

use std::sync::Arc;

use chrono::Utc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leased_jobs::jobs::{
    BackgroundJobProcessor, JobDependencies, JobSchedule, PeriodicJobRunner,
};
use leased_jobs::lock::{LockProvider, LockStore, MemoryLockStore};
use leased_jobs::samples::{
    DeleteOldUsersJob, EmailMessage, InMemoryLogFileSource, InMemoryUserRepository,
    OutboxSender, ProcessLogFilesJob, SendEmailsJob, User,
};
use leased_jobs::scheduler::{Scheduler, TokioScheduler};
use leased_jobs::{spawn_cleanup_task, Config};

/// Main entry point for the job host.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Open the lock store (Redis when configured, otherwise in memory)
/// 4. Register the periodic sample jobs and start the email workers
/// 5. Dispose every job on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" for this crate, can be overridden with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "leased_jobs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Leased Jobs host");

    let config = Config::from_env();
    info!(
        "Configuration loaded: redis={}, key_prefix={}, log_files_cron={}, email_workers={}",
        config.redis_url.is_some(),
        config.lock_key_prefix,
        config.log_files_cron,
        config.email_workers
    );

    let (store, cleanup_handle) = open_lock_store(&config)?;
    let locks = LockProvider::new(store).with_key_prefix(config.lock_key_prefix.clone());
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new());
    let deps = JobDependencies::new(locks, scheduler.clone());

    // Sample data so the jobs have something to do
    let users = InMemoryUserRepository::new();
    users
        .insert(User::new("dormant@example.com", Utc::now() - chrono::Duration::days(90)))
        .await;
    users.insert(User::new("active@example.com", Utc::now())).await;

    let log_files = InMemoryLogFileSource::new();
    log_files
        .add_file("app-1", r#"{"level":"error","message":"upstream timeout"}"#)
        .await;

    let delete_old_users = PeriodicJobRunner::new(
        DeleteOldUsersJob::new(
            Arc::new(users),
            config.stale_users_interval(),
            config.stale_users_retention(),
        ),
        deps.clone(),
    )?;
    delete_old_users.register();

    let process_log_files = PeriodicJobRunner::new(
        ProcessLogFilesJob::new(
            Arc::new(log_files),
            JobSchedule::cron(&config.log_files_cron)?,
        ),
        deps.clone(),
    )?;
    process_log_files.register();

    let send_emails = BackgroundJobProcessor::new(
        SendEmailsJob::new(Arc::new(OutboxSender::new()), config.email_workers),
        deps,
    )?;
    send_emails.start();
    send_emails
        .enqueue(EmailMessage {
            message_id: "welcome-1".to_string(),
            to: "active@example.com".to_string(),
            subject: "Welcome".to_string(),
            body: "Thanks for signing up.".to_string(),
        })
        .await?;

    info!("Jobs running, waiting for shutdown signal");
    shutdown_signal().await?;

    delete_old_users.dispose().await;
    process_log_files.dispose().await;
    send_emails.dispose().await;
    scheduler.stop();

    if let Some(handle) = cleanup_handle {
        handle.abort();
        warn!("Lease cleanup task aborted");
    }

    info!("Job host shutdown complete");
    Ok(())
}

/// Redis when `REDIS_URL` is set, otherwise the in-memory store plus its
/// sweeper task.
fn open_lock_store(
    config: &Config,
) -> anyhow::Result<(Arc<dyn LockStore>, Option<JoinHandle<()>>)> {
    if let Some(url) = &config.redis_url {
        #[cfg(feature = "redis")]
        {
            let store = leased_jobs::lock::RedisLockStore::open(url)?;
            info!("Using Redis lock store");
            return Ok((Arc::new(store), None));
        }
        #[cfg(not(feature = "redis"))]
        warn!(url = %url, "REDIS_URL set but the redis feature is disabled, using in-memory locks");
    }

    let store = MemoryLockStore::new();
    let cleanup = spawn_cleanup_task(store.clone(), config.lock_cleanup_interval());
    info!("Using in-memory lock store");
    Ok((Arc::new(store), Some(cleanup)))
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}
