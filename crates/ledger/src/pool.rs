use std::sync::Arc;

use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    Closed,
    Panicked(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Closed => write!(f, "crypto worker pool is closed"),
            PoolError::Panicked(msg) => write!(f, "crypto job panicked: {}", msg),
        }
    }
}

impl std::error::Error for PoolError {}

/// Bounded pool for CPU-bound crypto. At most `workers` jobs occupy the
/// blocking thread pool at once; the rest wait for a permit.
#[derive(Debug, Clone)]
pub struct CryptoPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl CryptoPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn run<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        tokio::task::spawn_blocking(job)
            .await
            .map_err(|err| PoolError::Panicked(err.to_string()))
    }

    pub fn close(&self) {
        self.permits.close();
    }
}
