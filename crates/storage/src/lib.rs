use chrono::{DateTime, Duration, Utc};
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Missing,
    Invalid,
    Timeout,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid state"),
            Self::Timeout => write!(f, "storage call timed out"),
        }
    }
}

impl Error for StorageError {}

pub struct Storage {
    client: tokio_postgres::Client,
    _pg_task: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub handle: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Session issued by the external auth collaborator. The relay only
/// resolves tokens to identities; it never issues or refreshes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl SessionRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_seconds)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Establishes connectivity to the PostgreSQL backend.
pub async fn connect(postgres_dsn: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    Ok(Storage {
        client,
        _pg_task: task,
    })
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Lightweight liveness probe.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Resolves a handshake token to the session issued for it.
    pub async fn load_session(&self, session_id: &str) -> Result<SessionRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT opaque_id, user_id, created_at, ttl_seconds FROM session WHERE opaque_id = $1",
                &[&session_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(SessionRecord {
            session_id: row.get(0),
            user_id: row.get(1),
            created_at: row.get(2),
            ttl_seconds: row.get(3),
        })
    }

    /// Loads a user profile by identifier.
    pub async fn load_user(&self, user_id: &str) -> Result<UserProfile, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT user_id, handle, display_name, created_at FROM app_user WHERE user_id = $1",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(UserProfile {
            user_id: row.get(0),
            handle: row.get(1),
            display_name: row.get(2),
            created_at: row.get(3),
        })
    }

    /// Answers whether two users have an accepted friendship, in either
    /// column order.
    pub async fn are_friends(&self, user_a: &str, user_b: &str) -> Result<bool, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM friendship
                WHERE ((user_a = $1 AND user_b = $2) OR (user_a = $2 AND user_b = $1))
                AND status = 'accepted'",
                &[&user_a, &user_b],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.is_some())
    }

    /// Appends a message to the durable log and returns the stored row.
    pub async fn append_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
    ) -> Result<StoredMessage, StorageError> {
        let now = Utc::now();
        let row = self
            .client
            .query_one(
                "INSERT INTO message (sender_id, receiver_id, content, created_at)
                VALUES ($1, $2, $3, $4)
                RETURNING id, sender_id, receiver_id, content, created_at",
                &[&sender_id, &receiver_id, &content, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(StoredMessage {
            id: row.get(0),
            sender_id: row.get(1),
            receiver_id: row.get(2),
            content: row.get(3),
            created_at: row.get(4),
        })
    }
}
