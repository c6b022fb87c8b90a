//! Routes requests to the engine worker and replies back to their callers

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;

use super::message::{
    Attachment, Command, ErrorPayload, ProtocolError, Reply, Request, RequestId, Response,
};
use super::worker::{WorkerEvent, run_worker};
use crate::pdf::{LayoutPolicy, PdfEngine, PdfError};

#[derive(Clone, Debug, PartialEq)]
enum Phase {
    Starting,
    Ready,
    Failed(String),
    Stopped,
}

struct RouterState {
    phase: Phase,
    requests: Option<Sender<Request>>,
    /// Submitted before the worker reported ready, in submission order
    backlog: VecDeque<Request>,
    pending: HashMap<RequestId, Sender<Response>>,
}

impl RouterState {
    fn forward(&mut self, request: Request) {
        let id = request.id;
        let sent = match &self.requests {
            Some(tx) => tx.send(request).is_ok(),
            None => false,
        };
        if !sent {
            self.reject(id, ErrorPayload::new("workerStopped", "engine worker is not running"));
        }
    }

    fn deliver(&mut self, response: Response) {
        match self.pending.remove(&response.id) {
            Some(reply) => {
                // The caller may have dropped its PendingReply
                let _ = reply.send(response);
            }
            None => warn!("dropping response for unknown request {}", response.id),
        }
    }

    fn reject(&mut self, id: RequestId, error: ErrorPayload) {
        self.deliver(Response::failure(id, error));
    }

    fn failure_payload(&self) -> Option<ErrorPayload> {
        match &self.phase {
            Phase::Failed(reason) => Some(ErrorPayload::new(
                "initFailed",
                format!("engine initialization failed: {reason}"),
            )),
            Phase::Stopped => Some(ErrorPayload::new(
                "workerStopped",
                "engine worker is not running",
            )),
            Phase::Starting | Phase::Ready => None,
        }
    }
}

struct Shared {
    state: Mutex<RouterState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reply to one submitted request
#[must_use = "dropping a PendingReply discards the response"]
#[derive(Debug)]
pub struct PendingReply {
    id: RequestId,
    rx: Receiver<Response>,
}

impl PendingReply {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Block until the response arrives.
    pub fn wait(self) -> Result<Response, ProtocolError> {
        self.rx.recv().map_err(|_| ProtocolError::WorkerGone)
    }

    /// Block for at most `timeout`; the reply stays usable after a timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Response, ProtocolError> {
        match self.rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(ProtocolError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ProtocolError::WorkerGone),
        }
    }

    pub async fn wait_async(self) -> Result<Response, ProtocolError> {
        self.rx
            .recv_async()
            .await
            .map_err(|_| ProtocolError::WorkerGone)
    }
}

/// Host-side end of the engine worker protocol.
///
/// Any number of threads may submit; replies are matched to requests by id,
/// so responses can complete in any order.
pub struct Dispatcher {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    worker: Option<JoinHandle<()>>,
    router: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start a worker thread that builds its engine with `init`.
    ///
    /// Requests may be submitted immediately; they are held until `init` succeeds.
    pub fn spawn<E, F>(init: F, layout: LayoutPolicy) -> std::io::Result<Self>
    where
        E: PdfEngine + 'static,
        F: FnOnce() -> Result<E, PdfError> + Send + 'static,
    {
        let (request_tx, request_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let worker = std::thread::Builder::new()
            .name("pdfgate-worker".into())
            .spawn(move || run_worker(init, layout, request_rx, event_tx))?;
        let mut dispatcher = Self::attach(request_tx, event_rx)?;
        dispatcher.worker = Some(worker);
        Ok(dispatcher)
    }

    /// Route over caller-provided channels; the other ends speak the worker side.
    pub fn attach(requests: Sender<Request>, events: Receiver<WorkerEvent>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(RouterState {
                phase: Phase::Starting,
                requests: Some(requests),
                backlog: VecDeque::new(),
                pending: HashMap::new(),
            }),
        });
        let router_shared = Arc::clone(&shared);
        let router = std::thread::Builder::new()
            .name("pdfgate-router".into())
            .spawn(move || route(&router_shared, &events))?;
        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            worker: None,
            router: Some(router),
        })
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared.lock().phase == Phase::Ready
    }

    pub fn submit(&self, command: Command, attachments: Vec<Attachment>) -> PendingReply {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (reply_tx, reply_rx) = flume::bounded(1);
        let request = Request {
            id,
            command,
            attachments,
        };

        let mut state = self.shared.lock();
        state.pending.insert(id, reply_tx);
        match state.failure_payload() {
            Some(error) => state.reject(id, error),
            None if state.phase == Phase::Starting => {
                debug!("queueing {id} {} until the worker is ready", request.command.name());
                state.backlog.push_back(request);
            }
            None => state.forward(request),
        }
        PendingReply { id, rx: reply_rx }
    }

    /// Submit and block for the decoded result.
    pub fn call<T: DeserializeOwned>(
        &self,
        command: Command,
        attachments: Vec<Attachment>,
    ) -> Result<Reply<T>, ProtocolError> {
        self.submit(command, attachments).wait()?.decode()
    }

    /// Stop accepting work and wait for both threads to finish.
    pub fn shutdown(mut self) {
        self.close();
        for handle in [self.worker.take(), self.router.take()].into_iter().flatten() {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }

    fn close(&self) {
        self.shared.lock().requests = None;
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Dispatcher")
            .field("phase", &state.phase)
            .field("backlog", &state.backlog.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

fn route(shared: &Shared, events: &Receiver<WorkerEvent>) {
    for event in events.iter() {
        let mut state = shared.lock();
        match event {
            WorkerEvent::Ready => {
                info!("worker ready, replaying {} queued requests", state.backlog.len());
                state.phase = Phase::Ready;
                while let Some(request) = state.backlog.pop_front() {
                    state.forward(request);
                }
            }
            WorkerEvent::InitFailed(reason) => {
                error!("worker failed to start: {reason}");
                state.phase = Phase::Failed(reason);
                let error = state.failure_payload();
                while let Some(request) = state.backlog.pop_front() {
                    if let Some(error) = error.clone() {
                        state.reject(request.id, error);
                    }
                }
            }
            WorkerEvent::Response(response) => state.deliver(response),
        }
    }

    let mut state = shared.lock();
    if !matches!(state.phase, Phase::Failed(_)) {
        state.phase = Phase::Stopped;
    }
    let error = state
        .failure_payload()
        .unwrap_or_else(|| ErrorPayload::new("workerStopped", "engine worker is not running"));
    let ids: Vec<RequestId> = state.pending.keys().copied().collect();
    if !ids.is_empty() {
        warn!("worker exited with {} requests unanswered", ids.len());
    }
    state.backlog.clear();
    for id in ids {
        state.reject(id, error.clone());
    }
    debug!("router stopping");
}
