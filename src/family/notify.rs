//! Invitation dispatch collaborator

use super::FamilyRole;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Invite dispatch failed: {0}")]
    Dispatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteNotification {
    pub to_email: String,
    pub from_name: String,
    pub role: FamilyRole,
    pub message: Option<String>,
    pub token: String,
}

/// Fire-and-forget delivery of invitations. Failures are logged by the
/// caller and never retried automatically.
#[async_trait]
pub trait InviteNotifier: Send + Sync {
    async fn send_invite(&self, notification: &InviteNotification) -> Result<(), NotifyError>;
}

/// Notifier that only records the dispatch in the log
pub struct LogNotifier;

#[async_trait]
impl InviteNotifier for LogNotifier {
    async fn send_invite(&self, notification: &InviteNotification) -> Result<(), NotifyError> {
        tracing::info!(
            "Invite for {} as {} from {}",
            notification.to_email,
            notification.role,
            notification.from_name
        );
        Ok(())
    }
}
