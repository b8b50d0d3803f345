use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use rusqlite::Connection;
use serde::Deserialize;
use tracing::warn;

use crate::narrative::{CancelToken, ChatClient};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Line-oriented writer shared by the request loop and narrative workers.
/// Each call writes one whole JSON line under the lock.
#[derive(Clone)]
pub struct Emitter {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Emitter {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn emit(&self, value: &serde_json::Value) {
        let line = serde_json::to_string(value).unwrap_or_else(|_| "{\"ok\":false}".to_string());
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            warn!(error = %e, "failed to write output line");
        }
    }
}

/// Cancel tokens of narrative streams still in flight, keyed by request id,
/// plus the worker threads that stream them.
#[derive(Clone, Default)]
pub struct NarrativeRegistry {
    inner: Arc<Mutex<HashMap<String, CancelToken>>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl NarrativeRegistry {
    pub fn register(&self, request_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.lock().insert(request_id.to_string(), token.clone());
        token
    }

    /// Returns false when no stream with that id is running.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.lock().get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, request_id: &str) {
        self.lock().remove(request_id);
    }

    pub fn is_running(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    pub fn track(&self, handle: JoinHandle<()>) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }

    /// Blocks until every tracked worker has emitted its terminal event.
    pub fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("narrative worker panicked");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancelToken>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

type DeferredJob = Box<dyn FnOnce() + Send>;

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub chat: Option<Arc<dyn ChatClient>>,
    pub emitter: Emitter,
    pub narratives: NarrativeRegistry,
    deferred: Vec<DeferredJob>,
}

impl AppState {
    pub fn new(chat: Option<Arc<dyn ChatClient>>, emitter: Emitter) -> Self {
        Self {
            workspace: None,
            db: None,
            chat,
            emitter,
            narratives: NarrativeRegistry::default(),
            deferred: Vec::new(),
        }
    }

    /// Queues work that must only start once the current response line has
    /// been written.
    pub fn after_response(&mut self, job: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(job));
    }

    pub fn run_deferred(&mut self) {
        for job in self.deferred.drain(..) {
            job();
        }
    }
}
