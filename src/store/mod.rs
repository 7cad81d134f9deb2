//! Record retrieval.
//!
//! - **`stream`**: the channel-backed [`RecordStream`] every retrieval returns,
//!   and [`spawn_producer`], which runs one background producer per call.
//! - **`sql`**: [`SqlStore`], the `sqlx`-backed implementation of [`RecordStore`].
//!
//! A store only reads. Each call opens its own cursor on the shared pool, so
//! any number of streams may be open against one store at the same time.

pub mod sql;
pub mod stream;

use crate::error::StoreError;
use crate::models::{Mailbox, User};
use std::future::Future;

pub use sql::SqlStore;
pub use stream::{Emitter, RecordStream, StreamSummary, spawn_producer};

/// Streaming access to mailboxes and their users.
///
/// Both operations fail only when the query cannot be issued at all. Rows that
/// fail to decode are skipped and counted in the stream's [`StreamSummary`].
pub trait RecordStore: Send + Sync + 'static {
    fn all_mailboxes(
        &self,
    ) -> impl Future<Output = Result<RecordStream<Mailbox>, StoreError>> + Send;

    fn users_for_mailbox(
        &self,
        mailbox_id: i64,
    ) -> impl Future<Output = Result<RecordStream<User>, StoreError>> + Send;
}
