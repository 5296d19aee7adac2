//! Background thread for update checks and downloads
//!
//! The game loop never blocks on the update server. It posts a request into
//! a bounded queue and polls a second bounded queue for results each frame.
//! Progress that the UI wants between results (status, cached info, last
//! error) sits behind one mutex and is only ever copied out.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use crate::error::UpdateError;
use crate::update::{UpdateChecker, UpdateConfig, UpdateInfo, UpdateStatus};

/// Depth of each queue
const QUEUE_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRequest {
    Check,
    Update,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerResult {
    Checked { available: bool },
    Updated,
    Failed { code: u32, message: String },
}

#[derive(Debug, Default)]
struct Shared {
    /// Request being worked on
    active: Option<WorkerRequest>,
    /// Requests posted but not yet picked up, oldest first
    queued: VecDeque<WorkerRequest>,
    status: UpdateStatus,
    info: Option<UpdateInfo>,
    error: Option<String>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct UpdateWorker {
    requests: Option<mpsc::Sender<WorkerRequest>>,
    results: mpsc::Receiver<WorkerResult>,
    shared: Arc<Mutex<Shared>>,
    handle: Option<JoinHandle<()>>,
}

impl UpdateWorker {
    pub fn spawn(config: UpdateConfig) -> Result<Self, UpdateError> {
        let (request_tx, request_rx) = mpsc::channel(QUEUE_DEPTH);
        let (result_tx, result_rx) = mpsc::channel(QUEUE_DEPTH);
        let shared = Arc::new(Mutex::new(Shared::default()));

        let checker = {
            let shared = Arc::clone(&shared);
            UpdateChecker::new(config).with_observer(Box::new(
                move |status: UpdateStatus, info: Option<&UpdateInfo>| {
                    let mut shared = lock(&shared);
                    shared.status = status;
                    shared.info = info.cloned();
                },
            ))
        };

        let handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("update-worker".to_string())
                .spawn(move || run(checker, request_rx, result_tx, shared))
                .map_err(UpdateError::Storage)?
        };

        Ok(Self {
            requests: Some(request_tx),
            results: result_rx,
            shared,
            handle: Some(handle),
        })
    }

    pub fn request_check(&self) -> Result<(), UpdateError> {
        self.post(WorkerRequest::Check)
    }

    pub fn request_update(&self) -> Result<(), UpdateError> {
        self.post(WorkerRequest::Update)
    }

    fn post(&self, request: WorkerRequest) -> Result<(), UpdateError> {
        let Some(requests) = &self.requests else {
            return Err(UpdateError::WorkerGone);
        };
        // the worker takes requests off `queued` under the same lock
        let mut shared = lock(&self.shared);
        match requests.try_send(request) {
            Ok(()) => {
                shared.queued.push_back(request);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(UpdateError::Busy),
            Err(TrySendError::Closed(_)) => Err(UpdateError::WorkerGone),
        }
    }

    /// Next finished request, if any. Never blocks.
    pub fn poll(&mut self) -> Option<WorkerResult> {
        match self.results.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn status(&self) -> UpdateStatus {
        lock(&self.shared).status
    }

    /// Request the worker is on, or will pick up next
    pub fn pending(&self) -> Option<WorkerRequest> {
        let shared = lock(&self.shared);
        shared.active.or_else(|| shared.queued.front().copied())
    }

    pub fn info(&self) -> Option<UpdateInfo> {
        lock(&self.shared).info.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared).error.clone()
    }

    /// Asks the worker to stop and waits for it. A transfer in progress
    /// finishes its current blocking call first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(requests) = self.requests.take() {
            // dropping the sender also wakes the worker if the queue is full
            if requests.try_send(WorkerRequest::Shutdown).is_err() {
                debug!("Request queue full, worker stops once it drains");
            }
        }
        // unblocks a worker waiting for room in the results queue
        self.results.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Update worker panicked");
            }
        }
    }
}

impl Drop for UpdateWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for UpdateWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateWorker")
            .field("status", &self.status())
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

fn run(
    mut checker: UpdateChecker,
    mut requests: mpsc::Receiver<WorkerRequest>,
    results: mpsc::Sender<WorkerResult>,
    shared: Arc<Mutex<Shared>>,
) {
    debug!("Update worker started");
    while let Some(request) = requests.blocking_recv() {
        if request != WorkerRequest::Shutdown {
            let mut shared = lock(&shared);
            shared.queued.pop_front();
            shared.active = Some(request);
        }
        let outcome = match request {
            WorkerRequest::Shutdown => break,
            WorkerRequest::Check => checker
                .check()
                .map(|available| WorkerResult::Checked { available }),
            WorkerRequest::Update => checker.update().map(|()| WorkerResult::Updated),
        };

        let result = {
            let mut shared = lock(&shared);
            shared.active = None;
            shared.status = checker.status();
            shared.info = checker.info().cloned();
            match outcome {
                Ok(result) => {
                    shared.error = None;
                    result
                }
                Err(e) => {
                    shared.error = Some(e.to_string());
                    WorkerResult::Failed {
                        code: e.code(),
                        message: e.to_string(),
                    }
                }
            }
        };

        if results.blocking_send(result).is_err() {
            debug!("Result queue closed");
            break;
        }
    }
    info!("Update worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{BuildType, Keypair, Version};
    use std::time::{Duration, Instant};

    fn wait_for(worker: &mut UpdateWorker) -> WorkerResult {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(result) = worker.poll() {
                return result;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("worker produced no result");
    }

    fn config(dir: &tempfile::TempDir) -> UpdateConfig {
        let mut config =
            UpdateConfig::new("127.0.0.1:9".parse().unwrap(), Version::new(1, 0, 0)).unwrap();
        config.server_key = Keypair::generate().public_key();
        config.staging_path = dir.path().join("staging.arc");
        config.install_path = dir.path().join("contents.arc");
        config.io_timeout = Duration::from_millis(500);
        config
    }

    #[test]
    fn test_update_without_check_reports_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = UpdateWorker::spawn(config(&dir)).unwrap();

        worker.request_update().unwrap();
        let result = wait_for(&mut worker);
        assert_eq!(
            result,
            WorkerResult::Failed {
                code: 40010,
                message: UpdateError::NotChecked.to_string(),
            }
        );
        assert_eq!(worker.status(), UpdateStatus::Idle);
        assert!(worker.pending().is_none());
        assert!(worker.last_error().is_some());
        worker.shutdown();
    }

    #[test]
    fn test_unreachable_server_fails_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = UpdateWorker::spawn(config(&dir)).unwrap();

        worker.request_check().unwrap();
        let WorkerResult::Failed { code, .. } = wait_for(&mut worker) else {
            panic!("check against a closed port succeeded");
        };
        assert_eq!(code, 40001);
        assert!(worker.info().is_none());
    }

    #[test]
    fn test_debug_build_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.build_type = BuildType::Debug;
        let mut worker = UpdateWorker::spawn(config).unwrap();

        worker.request_check().unwrap();
        assert!(matches!(
            wait_for(&mut worker),
            WorkerResult::Failed { code: 40000, .. }
        ));
    }

    #[test]
    fn test_pending_covers_queued_request() {
        let dir = tempfile::tempdir().unwrap();
        // accepts the connection but never answers
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = config(&dir);
        config.addr = listener.local_addr().unwrap();
        config.io_timeout = Duration::from_millis(300);
        let mut worker = UpdateWorker::spawn(config).unwrap();

        worker.request_update().unwrap();
        worker.request_check().unwrap();
        assert!(worker.pending().is_some());

        assert!(matches!(
            wait_for(&mut worker),
            WorkerResult::Failed { code: 40010, .. }
        ));
        assert_eq!(worker.pending(), Some(WorkerRequest::Check));

        assert!(matches!(wait_for(&mut worker), WorkerResult::Failed { .. }));
        assert_eq!(worker.pending(), None);
    }

    #[test]
    fn test_shutdown_with_unread_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.build_type = BuildType::Debug;
        let worker = UpdateWorker::spawn(config).unwrap();

        // two results fill the queue, the third leaves the worker waiting to send
        for _ in 0..2 {
            worker.request_check().unwrap();
            worker.request_check().unwrap();
            thread::sleep(Duration::from_millis(300));
        }

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            worker.shutdown();
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());
    }

    #[test]
    fn test_shutdown_joins_idle_worker() {
        let dir = tempfile::tempdir().unwrap();
        let worker = UpdateWorker::spawn(config(&dir)).unwrap();
        worker.shutdown();
    }
}
