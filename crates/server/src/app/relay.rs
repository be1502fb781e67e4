use super::friends::FriendshipGate;
use async_trait::async_trait;
use duochat_storage::{Storage, StorageError, StoredMessage};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

pub const MAX_CONTENT_LEN: usize = 8 * 1024;

/// Seam over the durable message log.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn append(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<StoredMessage, StorageError>;
}

#[async_trait]
impl MessageLog for Storage {
    async fn append(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<StoredMessage, StorageError> {
        self.append_message(sender_id, receiver_id, content).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    InvalidRequest(&'static str),
    Forbidden,
    StorageFailure,
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid-request",
            Self::Forbidden => "forbidden",
            Self::StorageFailure => "storage-failure",
        }
    }
}

impl Display for RelayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest(detail) => write!(f, "{}", detail),
            Self::Forbidden => {
                write!(f, "Cannot send message. You are not friends with this user.")
            }
            Self::StorageFailure => write!(f, "Failed to send message."),
        }
    }
}

impl Error for RelayError {}

/// Validates, authorizes and persists one outbound message. Forwarding to
/// the live connections stays with the lifecycle controller; this type
/// owns the exactly-one-persistence-write contract.
pub struct MessageRelay {
    gate: Arc<FriendshipGate>,
    log: Arc<dyn MessageLog>,
    append_timeout: Duration,
}

impl MessageRelay {
    pub fn new(gate: Arc<FriendshipGate>, log: Arc<dyn MessageLog>, append_timeout: Duration) -> Self {
        MessageRelay {
            gate,
            log,
            append_timeout,
        }
    }

    pub async fn send(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<StoredMessage, RelayError> {
        if receiver_id.trim().is_empty() {
            return Err(RelayError::InvalidRequest("receiver is required"));
        }
        if content.is_empty() {
            return Err(RelayError::InvalidRequest("content is empty"));
        }
        if content.len() > MAX_CONTENT_LEN {
            return Err(RelayError::InvalidRequest("content exceeds limits"));
        }
        match self.gate.can_exchange(sender_id, receiver_id).await {
            Ok(true) => {}
            Ok(false) => return Err(RelayError::Forbidden),
            Err(err) => {
                warn!(sender = sender_id, "friendship lookup failed: {}", err);
                return Err(RelayError::StorageFailure);
            }
        }
        match timeout(
            self.append_timeout,
            self.log.append(sender_id, receiver_id, content),
        )
        .await
        {
            Ok(Ok(stored)) => Ok(stored),
            Ok(Err(err)) => {
                warn!(sender = sender_id, "message append failed: {}", err);
                Err(RelayError::StorageFailure)
            }
            Err(_) => {
                warn!(sender = sender_id, "message append timed out");
                Err(RelayError::StorageFailure)
            }
        }
    }
}
