use std::future::Future;
use std::time::Duration;

/// Outcome of a future raced against a time limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deadline<T> {
    Completed(T),
    TimedOut,
}

impl<T> Deadline<T> {
    #[must_use]
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::TimedOut => None,
        }
    }
}

/// Run `fut` for at most `limit`. On timeout the future is dropped.
pub async fn with_deadline<F>(limit: Duration, fut: F) -> Deadline<F::Output>
where
    F: Future,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(value) => Deadline::Completed(value),
        Err(_) => Deadline::TimedOut,
    }
}
