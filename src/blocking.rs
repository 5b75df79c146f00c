//! The one place where work leaves the cooperative scheduler.
//!
//! DuckDB calls and MIME decoding of large messages are synchronous. They run
//! on tokio's blocking pool so the queue worker and scheduler timers keep
//! making progress. Nothing routed through here talks to Gmail.

use tokio::task::JoinError;

#[derive(Debug, thiserror::Error)]
#[error("blocking task did not complete: {0}")]
pub struct OffLoopError(#[from] JoinError);

pub async fn off_loop<T, F>(f: F) -> Result<T, OffLoopError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_closure_off_the_async_thread() {
        let caller = std::thread::current().id();
        let worker = off_loop(|| std::thread::current().id()).await.unwrap();
        assert_ne!(caller, worker);
    }

    #[tokio::test]
    async fn panics_surface_as_errors() {
        let result = off_loop(|| -> u8 { panic!("boom") }).await;
        assert!(result.is_err());
    }
}
