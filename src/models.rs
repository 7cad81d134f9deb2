use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

// ===== Stored Records =====

/// A top-level grouping record; users hang off a mailbox by `mailbox_id`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Mailbox {
    pub id: i64,
    pub mpi_id: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub created_at: String,
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.id)
            .field("mpi_id", &self.mpi_id)
            .field("token", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub mailbox_id: i64,
    pub user_name: String,
    pub email_address: String,
    pub created_at: String,
}

// ===== Run Reports =====

/// Outcome of one per-mailbox worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailboxReport {
    pub mailbox_id: i64,
    pub users_processed: usize,
    /// Rows the user stream skipped because they failed to decode
    pub users_skipped: usize,
    /// Set when the user stream ended on an iteration error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_error: Option<String>,
}

/// A mailbox whose users were never fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedMailbox {
    pub mailbox_id: i64,
    pub reason: String,
}
