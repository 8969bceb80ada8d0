use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::ProcessorError;

/// Bounded pool shared by the processors of one coordinator.
///
/// Runs are blocking (they hold store transactions), so each one executes on
/// tokio's blocking threads; the semaphore caps how many run at once.
#[derive(Clone)]
pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(runtime: Handle, size: usize) -> Self {
        let size = size.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// A pool on the runtime the caller is running in.
    pub fn current(size: usize) -> Result<Self, ProcessorError> {
        Ok(Self::new(Handle::try_current()?, size))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Run `job` on a pool thread once a slot is free.
    pub async fn run<F, T>(&self, job: F) -> Result<T, ProcessorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ProcessorError::PoolClosed)?;
        // the slot stays taken until the job returns, even if the caller is cancelled
        Ok(self
            .runtime
            .spawn_blocking(move || {
                let _permit = permit;
                job()
            })
            .await?)
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Refuse further runs. Runs already holding a slot finish normally.
    pub fn close(&self) {
        self.permits.close();
    }
}
