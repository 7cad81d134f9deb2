pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod store;

pub use config::Config;
pub use error::{PipelineError, StoreError};
pub use models::{Mailbox, MailboxReport, SkippedMailbox, User};
pub use pipeline::{LogProcessor, Pipeline, PipelineReport, PipelineState, UserProcessor};
pub use store::{RecordStore, RecordStream, SqlStore, StreamSummary};

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install the process-wide logger. Later calls are no-ops.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info,sqlx=warn")).init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_is_idempotent() {
        init_logger();
        init_logger();
    }
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::error::StoreError;
    use crate::models::{Mailbox, User};
    use crate::pipeline::UserProcessor;
    use crate::store::{Emitter, RecordStore, RecordStream, spawn_producer};
    use parking_lot::Mutex;
    use sqlx::AnyPool;
    use std::collections::{HashMap, HashSet};
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    pub use database::{TestDatabase, TestDatabaseError};

    fn timestamp() -> String {
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// Convenience helpers for seeding mailbox and user rows in tests.
    pub struct TestFixtures<'a> {
        pool: &'a AnyPool,
    }

    impl<'a> TestFixtures<'a> {
        /// Create a fixture helper bound to the provided pool.
        pub fn new(pool: &'a AnyPool) -> Self {
            Self { pool }
        }

        /// Insert a mailbox row, returning its id.
        pub async fn insert_mailbox(
            &self,
            id: i64,
            mpi_id: &str,
            token: &str,
        ) -> Result<i64, sqlx::Error> {
            sqlx::query("INSERT INTO mailboxes (id, mpi_id, token, created_at) VALUES ($1, $2, $3, $4)")
                .bind(id)
                .bind(mpi_id.to_string())
                .bind(token.to_string())
                .bind(timestamp())
                .execute(self.pool)
                .await?;
            Ok(id)
        }

        /// Insert a user row under `mailbox_id`, returning its id.
        pub async fn insert_user(
            &self,
            id: i64,
            mailbox_id: i64,
            user_name: &str,
            email_address: &str,
        ) -> Result<i64, sqlx::Error> {
            sqlx::query(
                "INSERT INTO users (id, mailbox_id, user_name, email_address, created_at) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id)
            .bind(mailbox_id)
            .bind(user_name.to_string())
            .bind(email_address.to_string())
            .bind(timestamp())
            .execute(self.pool)
            .await?;
            Ok(id)
        }

        /// Insert a user whose `user_name` is NULL, so the row cannot be decoded.
        pub async fn insert_incomplete_user(
            &self,
            id: i64,
            mailbox_id: i64,
        ) -> Result<i64, sqlx::Error> {
            sqlx::query(
                "INSERT INTO users (id, mailbox_id, email_address, created_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(mailbox_id)
            .bind(format!("user{}@example.com", id))
            .bind(timestamp())
            .execute(self.pool)
            .await?;
            Ok(id)
        }

        /// Insert `count` mailboxes with `users_each` users apiece.
        ///
        /// Mailbox ids run from 1, user ids are `mailbox_id * 1000 + n`.
        pub async fn seed(&self, count: i64, users_each: i64) -> Result<(), sqlx::Error> {
            for mailbox_id in 1..=count {
                self.insert_mailbox(
                    mailbox_id,
                    &format!("mpi{}", mailbox_id),
                    &format!("token{}", mailbox_id),
                )
                .await?;
                for n in 1..=users_each {
                    let user_id = mailbox_id * 1000 + n;
                    self.insert_user(
                        user_id,
                        mailbox_id,
                        &format!("user{}", user_id),
                        &format!("user{}@example.com", user_id),
                    )
                    .await?;
                }
            }
            Ok(())
        }
    }

    pub fn mailbox(id: i64) -> Mailbox {
        Mailbox {
            id,
            mpi_id: format!("mpi{}", id),
            token: format!("token{}", id),
            created_at: timestamp(),
        }
    }

    pub fn user(id: i64, mailbox_id: i64) -> User {
        User {
            id,
            mailbox_id,
            user_name: format!("user{}", id),
            email_address: format!("user{}@example.com", id),
            created_at: timestamp(),
        }
    }

    #[derive(Clone, Default)]
    struct MemoryData {
        mailboxes: Vec<Mailbox>,
        users: Vec<User>,
        fail_mailboxes: bool,
        failing_users: HashSet<i64>,
        /// mailbox id -> users emitted before the stream breaks
        broken_users: HashMap<i64, usize>,
        /// mailbox id -> time before the first user is available
        slow_users: HashMap<i64, Duration>,
    }

    /// In-memory [`RecordStore`] with injectable failures.
    #[derive(Clone, Default)]
    pub struct MemoryStore {
        data: Arc<MemoryData>,
        channel_capacity: usize,
    }

    impl MemoryStore {
        pub fn new(mailboxes: Vec<Mailbox>, users: Vec<User>) -> Self {
            Self {
                data: Arc::new(MemoryData {
                    mailboxes,
                    users,
                    ..Default::default()
                }),
                channel_capacity: crate::config::DEFAULT_CHANNEL_CAPACITY,
            }
        }

        /// `mailboxes` mailboxes with `users_each` users apiece, ids as in [`TestFixtures::seed`].
        pub fn seeded(mailboxes: i64, users_each: i64) -> Self {
            let mut all_users = Vec::new();
            for mailbox_id in 1..=mailboxes {
                for n in 1..=users_each {
                    all_users.push(user(mailbox_id * 1000 + n, mailbox_id));
                }
            }
            Self::new((1..=mailboxes).map(mailbox).collect(), all_users)
        }

        fn data_mut(&mut self) -> &mut MemoryData {
            Arc::make_mut(&mut self.data)
        }

        pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
            self.channel_capacity = capacity.max(1);
            self
        }

        /// Make `all_mailboxes` fail before yielding anything.
        pub fn with_mailbox_failure(mut self) -> Self {
            self.data_mut().fail_mailboxes = true;
            self
        }

        /// Make `users_for_mailbox(mailbox_id)` fail before yielding anything.
        pub fn with_user_failure(mut self, mailbox_id: i64) -> Self {
            self.data_mut().failing_users.insert(mailbox_id);
            self
        }

        /// Hold back the first user of `mailbox_id` for `delay`.
        pub fn with_slow_user_fetch(mut self, mailbox_id: i64, delay: Duration) -> Self {
            self.data_mut().slow_users.insert(mailbox_id, delay);
            self
        }

        /// Break the user stream of `mailbox_id` after `after` users.
        pub fn with_broken_user_stream(mut self, mailbox_id: i64, after: usize) -> Self {
            self.data_mut().broken_users.insert(mailbox_id, after);
            self
        }
    }

    fn injected(message: String) -> sqlx::Error {
        sqlx::Error::Protocol(message)
    }

    async fn emit_all<T>(
        mut emitter: Emitter<T>,
        items: Vec<T>,
        break_after: Option<usize>,
    ) -> (Emitter<T>, Result<(), StoreError>) {
        emitter.started();
        for (n, item) in items.into_iter().enumerate() {
            if break_after == Some(n) {
                let err = StoreError::iteration(
                    emitter.label(),
                    injected("injected connection reset".to_string()),
                );
                return (emitter, Err(err));
            }
            if !emitter.emit(item).await {
                break;
            }
        }
        (emitter, Ok(()))
    }

    impl RecordStore for MemoryStore {
        fn all_mailboxes(
            &self,
        ) -> impl Future<Output = Result<RecordStream<Mailbox>, StoreError>> + Send {
            let data = Arc::clone(&self.data);
            spawn_producer("mailboxes", self.channel_capacity, move |emitter| async move {
                if data.fail_mailboxes {
                    let err = StoreError::query(
                        emitter.label(),
                        injected("injected mailbox failure".to_string()),
                    );
                    return (emitter, Err(err));
                }
                emit_all(emitter, data.mailboxes.clone(), None).await
            })
        }

        fn users_for_mailbox(
            &self,
            mailbox_id: i64,
        ) -> impl Future<Output = Result<RecordStream<User>, StoreError>> + Send {
            let data = Arc::clone(&self.data);
            spawn_producer(
                format!("users(mailbox={})", mailbox_id),
                self.channel_capacity,
                move |emitter| async move {
                    if let Some(delay) = data.slow_users.get(&mailbox_id).copied() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = emitter.closed() => return (emitter, Ok(())),
                        }
                    }
                    if data.failing_users.contains(&mailbox_id) {
                        let err = StoreError::query(
                            emitter.label(),
                            injected(format!("injected failure for mailbox {}", mailbox_id)),
                        );
                        return (emitter, Err(err));
                    }
                    let users: Vec<User> = data
                        .users
                        .iter()
                        .filter(|user| user.mailbox_id == mailbox_id)
                        .cloned()
                        .collect();
                    let break_after = data.broken_users.get(&mailbox_id).copied();
                    emit_all(emitter, users, break_after).await
                },
            )
        }
    }

    /// Processor that remembers every user it was handed, together with the
    /// mailbox of the worker that handed it over.
    #[derive(Clone, Default)]
    pub struct RecordingProcessor {
        seen: Arc<Mutex<Vec<(i64, User)>>>,
    }

    impl RecordingProcessor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn users(&self) -> Vec<User> {
            self.seen.lock().iter().map(|(_, user)| user.clone()).collect()
        }

        /// `(dispatched mailbox id, user)` pairs in processing order.
        pub fn dispatched(&self) -> Vec<(i64, User)> {
            self.seen.lock().clone()
        }

        pub fn count(&self) -> usize {
            self.seen.lock().len()
        }

        /// Users handed over by the worker for `mailbox_id`, in processing order.
        pub fn users_for(&self, mailbox_id: i64) -> Vec<User> {
            self.seen
                .lock()
                .iter()
                .filter(|(dispatched, _)| *dispatched == mailbox_id)
                .map(|(_, user)| user.clone())
                .collect()
        }
    }

    impl UserProcessor for RecordingProcessor {
        fn process(&self, user: User) {
            self.seen.lock().push((user.mailbox_id, user));
        }

        fn process_for(&self, mailbox: &Mailbox, user: User) {
            self.seen.lock().push((mailbox.id, user));
        }
    }

    pub mod database {
        use crate::db;
        use crate::error::StoreError;
        use crate::store::SqlStore;
        use sqlx::AnyPool;
        use std::path::{Path, PathBuf};
        use tempfile::TempDir;
        use thiserror::Error;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("io error: {0}")]
            Io(#[from] std::io::Error),
            #[error("store error: {0}")]
            Store(#[from] StoreError),
        }

        /// Ephemeral sqlite database in a temporary directory.
        pub struct TestDatabase {
            pool: Option<AnyPool>,
            path: PathBuf,
            _dir: TempDir,
        }

        impl TestDatabase {
            /// Provision a fresh, migrated database.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let database = Self::new_unmigrated().await?;
                db::run_migrations(database.pool()).await?;
                Ok(database)
            }

            /// Provision a fresh database without applying any migration.
            pub async fn new_unmigrated() -> Result<Self, TestDatabaseError> {
                let dir = tempfile::tempdir()?;
                let path = dir.path().join("mailboxes.db");
                let pool = db::connect("sqlite", &path.to_string_lossy(), 5).await?;

                Ok(Self {
                    pool: Some(pool),
                    path,
                    _dir: dir,
                })
            }

            /// Cloneable connection pool for use in tests.
            pub fn pool(&self) -> &AnyPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            /// Convenience method returning a clone of the pooled connection handle.
            pub fn pool_clone(&self) -> AnyPool {
                self.pool().clone()
            }

            pub fn path(&self) -> &Path {
                &self.path
            }

            /// A store over this database.
            pub fn store(&self) -> SqlStore {
                SqlStore::new(self.pool_clone())
            }

            /// Re-run migrations to ensure schema freshness (idempotent).
            pub async fn reset(&self) -> Result<(), TestDatabaseError> {
                db::run_migrations(self.pool()).await?;
                Ok(())
            }

            /// Close pool connections; the directory is removed on drop.
            pub async fn close(mut self) {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }
            }
        }
    }
}
