use crate::config::{Config, DEFAULT_CHANNEL_CAPACITY};
use crate::db::{self, AnyPool};
use crate::error::StoreError;
use crate::models::{Mailbox, User};
use crate::store::RecordStore;
use crate::store::stream::{Emitter, RecordStream, spawn_producer};
use futures::{Stream, TryStreamExt};
use sqlx::FromRow;
use sqlx::any::AnyRow;
use std::future::Future;

const MAILBOXES_SQL: &str = "SELECT id, mpi_id, token, created_at FROM mailboxes";

const USERS_FOR_MAILBOX_SQL: &str =
    "SELECT id, mailbox_id, user_name, email_address, created_at FROM users WHERE mailbox_id = $1";

/// [`RecordStore`] over a shared `sqlx` pool.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct SqlStore {
    pool: AnyPool,
    channel_capacity: usize,
}

impl SqlStore {
    pub fn new(pool: AnyPool) -> Self {
        Self {
            pool,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Records buffered per stream before its producer waits for the consumer.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Open a store from a driver name and a connection source.
    pub async fn connect(
        driver: &str,
        source: &str,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pool = db::connect(driver, source, max_connections).await?;
        Ok(Self::new(pool))
    }

    pub async fn from_config(config: &Config) -> Result<Self, StoreError> {
        let pool = db::connect_with_config(&config.database).await?;
        Ok(Self::new(pool).with_channel_capacity(config.pipeline.channel_capacity))
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl RecordStore for SqlStore {
    fn all_mailboxes(
        &self,
    ) -> impl Future<Output = Result<RecordStream<Mailbox>, StoreError>> + Send {
        let pool = self.pool.clone();
        spawn_producer(
            "mailboxes",
            self.channel_capacity,
            move |emitter| async move {
                let rows = sqlx::query(MAILBOXES_SQL).fetch(&pool);
                forward_rows(emitter, rows, "mailbox").await
            },
        )
    }

    fn users_for_mailbox(
        &self,
        mailbox_id: i64,
    ) -> impl Future<Output = Result<RecordStream<User>, StoreError>> + Send {
        let pool = self.pool.clone();
        spawn_producer(
            format!("users(mailbox={})", mailbox_id),
            self.channel_capacity,
            move |emitter| async move {
                let rows = sqlx::query(USERS_FOR_MAILBOX_SQL)
                    .bind(mailbox_id)
                    .fetch(&pool);
                forward_rows(emitter, rows, "user").await
            },
        )
    }
}

/// Decode `rows` into `emitter` until the cursor is exhausted, fails, or the
/// consumer goes away. The cursor is dropped on return, releasing its connection.
async fn forward_rows<T, S>(
    mut emitter: Emitter<T>,
    mut rows: S,
    record: &'static str,
) -> (Emitter<T>, Result<(), StoreError>)
where
    T: for<'r> FromRow<'r, AnyRow> + Send + 'static,
    S: Stream<Item = Result<AnyRow, sqlx::Error>> + Unpin + Send,
{
    let mut issued = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = emitter.closed() => None,
            row = rows.try_next() => Some(row),
        };

        let Some(next) = next else {
            log::debug!("{}: consumer closed, stopping query", emitter.label());
            return (emitter, Ok(()));
        };

        match next {
            Ok(Some(row)) => {
                if !issued {
                    issued = true;
                    emitter.started();
                }
                match T::from_row(&row) {
                    Ok(item) => {
                        if !emitter.emit(item).await {
                            return (emitter, Ok(()));
                        }
                    }
                    Err(err) => emitter.skip(&StoreError::decode(record, err)),
                }
            }
            Ok(None) => return (emitter, Ok(())),
            Err(err) => {
                let err = if issued {
                    StoreError::iteration(emitter.label(), err)
                } else {
                    StoreError::query(emitter.label(), err)
                };
                return (emitter, Err(err));
            }
        }
    }
}
