use tokio::runtime::{Handle, RuntimeFlavor};

/// Run blocking store work (SQLite calls, busy waits, retry backoff).
///
/// On a multi-threaded runtime the calling worker hands its queued tasks to
/// another thread first, so lease renewal and step timers keep running.
/// Outside a runtime, or on a current-thread runtime, the work runs in place.
pub(crate) fn offload<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::offload;

    #[test]
    fn runs_in_place_outside_a_runtime() {
        assert_eq!(offload(|| 7), 7);
    }

    #[tokio::test]
    async fn runs_in_place_on_a_current_thread_runtime() {
        assert_eq!(offload(|| 7), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn blocked_store_work_leaves_the_worker_free() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let blocked = tokio::spawn(async move {
            let _ = started_tx.send(());
            offload(move || release_rx.recv_timeout(Duration::from_secs(2)))
        });
        started_rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap_or_else(|_| unreachable!());

        // Only one worker exists; this task runs only if the blocked one let go of it.
        let other = tokio::spawn(async { 42 }).await;
        assert_eq!(other.ok(), Some(42));

        let _ = release_tx.send(());
        let outcome = blocked.await;
        assert!(matches!(outcome, Ok(Ok(()))));
    }
}
