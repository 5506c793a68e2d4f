use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// A single cancellable delayed job. Scheduling again replaces (and aborts) the previous job.
#[derive(Debug, Default)]
pub struct DeferredTask {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` after `delay`, cancelling whatever was scheduled before. The swap happens under
    /// one lock so two jobs are never armed at once.
    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.handle.lock();
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            job.await;
        }));
    }

    /// Returns whether an unfinished job was cancelled.
    pub fn cancel(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
