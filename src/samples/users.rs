//! Stale user cleanup.
//!
//! Runs on a fixed interval with the leader lock only: one node per tick
//! deletes users that have been inactive longer than the retention window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::jobs::{ExecutionContext, JobOptions, JobSchedule, PeriodicJob, SingleConsumerMode};

pub const DELETE_OLD_USERS_JOB_ID: &str = "delete-old-users";

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub last_active_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: impl Into<String>, last_active_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            last_active_at,
        }
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Deletes users last active before `cutoff`; returns how many.
    async fn delete_inactive_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize>;
}

/// Process-local user table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserRepository {
    users: Arc<RwLock<Vec<User>>>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: User) {
        self.users.write().await.push(user);
    }

    pub async fn emails(&self) -> Vec<String> {
        self.users.read().await.iter().map(|u| u.email.clone()).collect()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn delete_inactive_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        let mut users = self.users.write().await;
        let before = users.len();
        users.retain(|user| user.last_active_at >= cutoff);
        Ok(before - users.len())
    }
}

pub struct DeleteOldUsersJob {
    options: JobOptions,
    repository: Arc<dyn UserRepository>,
    retention: Duration,
}

impl DeleteOldUsersJob {
    pub fn new(repository: Arc<dyn UserRepository>, every: Duration, retention: Duration) -> Self {
        Self {
            options: JobOptions::new(DELETE_OLD_USERS_JOB_ID, JobSchedule::every(every))
                .with_single_consumer_mode(SingleConsumerMode::enabled())
                .with_log_execution(false),
            repository,
            retention,
        }
    }
}

#[async_trait]
impl PeriodicJob for DeleteOldUsersJob {
    fn options(&self) -> &JobOptions {
        &self.options
    }

    async fn process_internal(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let cutoff = ctx.started_at() - chrono::Duration::from_std(self.retention)?;
        let deleted = self.repository.delete_inactive_since(cutoff).await?;

        info!(deleted, cutoff = %cutoff, "Stale users deleted");
        Ok(())
    }
}
