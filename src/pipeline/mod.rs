//! Mailbox → user fan-out.
//!
//! # Flow
//!
//! 1. Open the mailbox stream. Failing to open it aborts the run.
//! 2. For each mailbox, in stream order:
//!    - open its user stream (on failure: log, record as skipped, move on)
//!    - register one unit of pending work
//!    - spawn a worker that drains the user stream through the [`UserProcessor`]
//! 3. Once the mailbox stream is exhausted, wait for every registered worker.
//!
//! Workers run concurrently with each other and with the mailbox producer.
//! Only the order in which mailboxes are *dispatched* is fixed; completion order
//! and log interleaving across workers are not.
//!
//! # States
//!
//! `Idle → FetchingMailboxes → Dispatching → Joining → Completed`, or
//! `Aborted` when the mailbox stream cannot be opened. A run whose
//! cancellation token fires ends in `Cancelled` after the join.

pub mod processor;
pub mod wait_group;

use crate::error::PipelineError;
use crate::models::{Mailbox, MailboxReport, SkippedMailbox, User};
use crate::store::{RecordStore, RecordStream};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use processor::{LogProcessor, UserProcessor};
pub use wait_group::{WaitGroup, WorkGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    FetchingMailboxes,
    Dispatching,
    Joining,
    Completed,
    Aborted,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Aborted | PipelineState::Cancelled
        )
    }
}

/// Result of a run that got past the mailbox fetch.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub state: PipelineState,
    pub mailboxes_seen: usize,
    pub workers_dispatched: usize,
    /// One entry per worker that ran to the end, ordered by mailbox id
    pub mailboxes: Vec<MailboxReport>,
    pub skipped_mailboxes: Vec<SkippedMailbox>,
    /// Mailbox rows dropped because they failed to decode
    pub mailbox_rows_skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mailbox_stream_error: Option<String>,
}

impl PipelineReport {
    pub fn total_users_processed(&self) -> usize {
        self.mailboxes.iter().map(|m| m.users_processed).sum()
    }

    pub fn mailbox(&self, mailbox_id: i64) -> Option<&MailboxReport> {
        self.mailboxes.iter().find(|m| m.mailbox_id == mailbox_id)
    }
}

pub struct Pipeline<S, P> {
    store: S,
    processor: Arc<P>,
    run_id: Uuid,
    cancel: CancellationToken,
    state: watch::Sender<PipelineState>,
}

impl<S, P> Pipeline<S, P>
where
    S: RecordStore,
    P: UserProcessor,
{
    pub fn new(store: S, processor: P) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            store,
            processor: Arc::new(processor),
            run_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Identifier prefixed to every log line of this run.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Token that stops dispatch and makes every worker stop consuming.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Follow the run-level state.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    fn set_state(&self, state: PipelineState) {
        log::debug!("run {}: state -> {:?}", self.run_id, state);
        self.state.send_replace(state);
    }

    /// Run the pipeline to completion.
    ///
    /// Returns only after every dispatched worker has finished. The only error is
    /// a failure to open the mailbox stream, in which case no worker was started.
    pub async fn run(&self) -> Result<PipelineReport, PipelineError> {
        let run_id = self.run_id;
        log::info!("run {}: starting mailbox pipeline", run_id);

        self.set_state(PipelineState::FetchingMailboxes);
        let mut mailboxes = match self.store.all_mailboxes().await {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("run {}: failed to fetch mailboxes: {}", run_id, err);
                self.set_state(PipelineState::Aborted);
                return Err(PipelineError::MailboxFetch(err));
            }
        };

        self.set_state(PipelineState::Dispatching);

        let workers = WaitGroup::new();
        let reports: Arc<Mutex<Vec<MailboxReport>>> = Arc::default();
        let mut mailboxes_seen = 0;
        let mut workers_dispatched = 0;
        let mut skipped_mailboxes = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                mailbox = mailboxes.next() => mailbox,
            };
            let Some(mailbox) = next else {
                break;
            };

            mailboxes_seen += 1;
            log::info!("run {}: processing mailbox {}", run_id, mailbox.id);

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                users = self.store.users_for_mailbox(mailbox.id) => Some(users),
            };
            let users = match fetched {
                None => {
                    log::debug!(
                        "run {}: cancelled while fetching users of mailbox {}",
                        run_id,
                        mailbox.id
                    );
                    break;
                }
                Some(Ok(users)) => users,
                Some(Err(err)) => {
                    log::warn!(
                        "run {}: skipping users of mailbox {}: {}",
                        run_id,
                        mailbox.id,
                        err
                    );
                    skipped_mailboxes.push(SkippedMailbox {
                        mailbox_id: mailbox.id,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            // Registered before the spawn so the join below can never miss it.
            let guard = workers.register();
            workers_dispatched += 1;

            tokio::spawn(process_mailbox(
                run_id,
                mailbox,
                users,
                Arc::clone(&self.processor),
                Arc::clone(&reports),
                self.cancel.clone(),
                guard,
            ));
        }

        let mailbox_summary = mailboxes.finish().await;

        self.set_state(PipelineState::Joining);
        log::debug!(
            "run {}: waiting for {} workers",
            run_id,
            workers.pending()
        );
        workers.wait().await;

        let mut mailbox_reports = std::mem::take(&mut *reports.lock());
        mailbox_reports.sort_by_key(|report| report.mailbox_id);

        if mailbox_reports.len() < workers_dispatched {
            log::warn!(
                "run {}: {} workers exited without a report",
                run_id,
                workers_dispatched - mailbox_reports.len()
            );
        }

        let state = if self.cancel.is_cancelled() {
            PipelineState::Cancelled
        } else {
            PipelineState::Completed
        };

        let report = PipelineReport {
            run_id,
            state,
            mailboxes_seen,
            workers_dispatched,
            mailboxes: mailbox_reports,
            skipped_mailboxes,
            mailbox_rows_skipped: mailbox_summary.skipped,
            mailbox_stream_error: mailbox_summary.error.map(|err| err.to_string()),
        };

        log::info!(
            "run {}: {:?} - {} mailboxes, {} workers, {} users processed, {} mailboxes skipped",
            run_id,
            state,
            report.mailboxes_seen,
            report.workers_dispatched,
            report.total_users_processed(),
            report.skipped_mailboxes.len()
        );

        self.set_state(state);
        Ok(report)
    }
}

/// Worker body: drain one mailbox's users, then report.
///
/// The report is pushed before `guard` drops, so the join always sees it.
async fn process_mailbox<P: UserProcessor>(
    run_id: Uuid,
    mailbox: Mailbox,
    mut users: RecordStream<User>,
    processor: Arc<P>,
    reports: Arc<Mutex<Vec<MailboxReport>>>,
    cancel: CancellationToken,
    guard: WorkGuard,
) {
    let _guard = guard;
    let mut processed = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            user = users.next() => user,
        };
        let Some(user) = next else {
            break;
        };

        processor.process_for(&mailbox, user);
        processed += 1;
    }

    let summary = users.finish().await;
    if summary.consumer_closed && cancel.is_cancelled() {
        log::warn!(
            "run {}: mailbox {} cancelled after {} users",
            run_id,
            mailbox.id,
            processed
        );
    }

    log::info!(
        "run {}: {} users processed for mailbox {}",
        run_id,
        processed,
        mailbox.id
    );

    reports.lock().push(MailboxReport {
        mailbox_id: mailbox.id,
        users_processed: processed,
        users_skipped: summary.skipped,
        stream_error: summary.error.map(|err| err.to_string()),
    });
}
