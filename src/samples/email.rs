//! Outgoing email delivery as a background job.
//!
//! Messages may be enqueued more than once, on one node or several. A lock
//! per message, `email:{message_id}`, left to expire after sending, keeps a
//! duplicate from going out while the lease lasts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::jobs::{BackgroundJob, BackgroundJobOptions, ExclusiveLockRequest, ExecutionContext};

pub const SEND_EMAILS_QUEUE_ID: &str = "send-emails";

pub const DEFAULT_MESSAGE_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

pub fn message_lock_name(message_id: &str) -> String {
    format!("email:{message_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub message_id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// Sender that keeps delivered messages in memory.
#[derive(Debug, Clone, Default)]
pub struct OutboxSender {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
    rejected_domains: Arc<Vec<String>>,
}

impl OutboxSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails delivery to any address ending in one of `domains`.
    pub fn rejecting(domains: &[&str]) -> Self {
        Self {
            sent: Arc::default(),
            rejected_domains: Arc::new(domains.iter().map(|d| d.to_string()).collect()),
        }
    }

    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailSender for OutboxSender {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        if self
            .rejected_domains
            .iter()
            .any(|domain| message.to.ends_with(domain.as_str()))
        {
            anyhow::bail!("recipient {} rejected", message.to);
        }
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

pub struct SendEmailsJob {
    options: BackgroundJobOptions,
    sender: Arc<dyn EmailSender>,
}

impl SendEmailsJob {
    pub fn new(sender: Arc<dyn EmailSender>, workers: usize) -> Self {
        Self {
            options: BackgroundJobOptions::new(SEND_EMAILS_QUEUE_ID)
                .with_concurrency(workers)
                .with_lock_timeout(DEFAULT_MESSAGE_LOCK_TIMEOUT),
            sender,
        }
    }
}

#[async_trait]
impl BackgroundJob for SendEmailsJob {
    type Payload = EmailMessage;

    fn options(&self) -> &BackgroundJobOptions {
        &self.options
    }

    async fn process_internal(
        &self,
        ctx: &ExecutionContext,
        message: EmailMessage,
    ) -> anyhow::Result<()> {
        let request = ExclusiveLockRequest::named(message_lock_name(&message.message_id));
        let Some(mut lock) = ctx.try_acquire_exclusive_lock(request).await? else {
            debug!(message_id = %message.message_id, "Message already being sent, skipping");
            return Ok(());
        };

        let result = self.sender.send(&message).await;
        lock.stop_refresh();
        result?;

        info!(message_id = %message.message_id, to = %message.to, "Email sent");
        Ok(())
    }
}
