use crate::models::{Mailbox, User};

/// Side effect applied to every user the pipeline reads.
///
/// Implementations handle their own failures; the pipeline neither retries nor
/// inspects the outcome. Calls come from many workers at once.
pub trait UserProcessor: Send + Sync + 'static {
    fn process(&self, user: User);

    /// Entry point used by the worker bound to `mailbox`.
    fn process_for(&self, _mailbox: &Mailbox, user: User) {
        self.process(user)
    }
}

impl<F> UserProcessor for F
where
    F: Fn(User) + Send + Sync + 'static,
{
    fn process(&self, user: User) {
        self(user)
    }
}

/// Logs each user. The mailbox token is never written out.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProcessor;

impl UserProcessor for LogProcessor {
    fn process(&self, user: User) {
        log::info!(
            "processing user: name={}, mailbox={}, mailbox token=<redacted>",
            user.user_name,
            user.mailbox_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn user(id: i64) -> User {
        User {
            id,
            mailbox_id: 1,
            user_name: format!("user{}", id),
            email_address: format!("user{}@example.com", id),
            created_at: "2024-07-23 12:30:00".to_string(),
        }
    }

    #[test]
    fn test_closure_is_a_processor() {
        let sum = Arc::new(AtomicI64::new(0));
        let seen = Arc::clone(&sum);
        let processor = move |user: User| {
            seen.fetch_add(user.id, Ordering::SeqCst);
        };

        processor.process(user(101));
        processor.process(user(102));
        assert_eq!(sum.load(Ordering::SeqCst), 203);
    }

    #[test]
    fn test_process_for_defaults_to_process() {
        let sum = Arc::new(AtomicI64::new(0));
        let seen = Arc::clone(&sum);
        let processor = move |user: User| {
            seen.fetch_add(user.id, Ordering::SeqCst);
        };
        let mailbox = Mailbox {
            id: 1,
            mpi_id: "mpi123".to_string(),
            token: "token123".to_string(),
            created_at: "2024-07-23 12:00:00".to_string(),
        };

        processor.process_for(&mailbox, user(101));
        assert_eq!(sum.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn test_log_processor_accepts_users() {
        LogProcessor.process(user(7));
    }
}
