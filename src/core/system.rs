//! The generic `System` actor base described in spec.md §4.1: every other
//! stateful component (`ChatSystem`, `GameSystem`, `Universe`,
//! `WebSocketController`) embeds a `SystemCore<E>` for its event stream,
//! background pipes and `(kind, id)` registration.
//!
//! This is the idiomatic-Rust translation of the teacher's actor
//! primitives (`actix::Actor`/`Context`/`Addr`, the named-task bookkeeping
//! in `game/game/server.rs`'s `GameServer::tasks`) onto a direct,
//! `tokio::sync::mpsc`-based event queue: a System here is a plain struct
//! with async methods rather than an `actix::Actor` with a mailbox, since
//! spec.md §4.3 has callers invoke command methods directly under the
//! owner's lock instead of message-passing into it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Global `(kind, id)` registration set. Construction of any System
/// variant inserts here; a duplicate `(kind, id)` is a fatal invariant
/// violation per spec.md §4.1, so registration panics rather than
/// returning an error — there is no recovery from two live handles
/// claiming the same identity.
fn registry() -> &'static Mutex<HashSet<(&'static str, Uuid)>> {
    static REGISTRY: OnceLock<Mutex<HashSet<(&'static str, Uuid)>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Registers `(kind, id)` in the process-global index, or panics if it is
/// already present. Returns a guard that deregisters on drop, so a System
/// that is dropped without calling `stop()` still frees its identity.
pub struct Registration {
    key: (&'static str, Uuid),
}

impl Registration {
    pub fn new(kind: &'static str, id: Uuid) -> Self {
        let mut set = registry().lock().expect("system registry poisoned");
        if !set.insert((kind, id)) {
            panic!("duplicate System registration for ({}, {})", kind, id);
        }
        Self { key: (kind, id) }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        registry().lock().expect("system registry poisoned").remove(&self.key);
    }
}

/// A pipe failed; surfaced through `listen()` as a fatal event for the
/// owning System, matching spec.md §4.1's `PipeFailure` marker.
#[derive(Debug, Clone)]
pub struct PipeFailure(pub String);

/// The event-producing actor base. `E` is the System's own typed event.
pub struct SystemCore<E> {
    _registration: Registration,
    tx: mpsc::UnboundedSender<E>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<E>>>,
    pipes: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<E: Send + 'static> SystemCore<E> {
    pub fn new(kind: &'static str, id: Uuid) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            _registration: Registration::new(kind, id),
            tx,
            rx: Mutex::new(Some(rx)),
            pipes: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Non-blocking enqueue; a no-op once `stop()` has run.
    pub fn emit(&self, event: E) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        // An unbounded send only fails once every receiver has been
        // dropped, which only happens after `stop()` clears `stopped`;
        // the error is therefore benign here.
        let _ = self.tx.send(event);
    }

    /// Single-consumer pull. Calling this twice on the same System is a
    /// programmer error (spec.md §4.1).
    pub fn listen(&self) -> Result<mpsc::UnboundedReceiver<E>, &'static str> {
        self.rx
            .lock()
            .expect("system receiver poisoned")
            .take()
            .ok_or("listen() called twice on the same System")
    }

    /// Registers a background pipe task. The returned `JoinHandle` is kept
    /// so `stop()` can await it; a `report_failure` closure should be
    /// wired into the pipe body so a broken pipe is observable instead of
    /// silently dying.
    pub fn add_pipe(&self, handle: JoinHandle<()>) {
        self.pipes.lock().expect("system pipes poisoned").push(handle);
    }

    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<_> = std::mem::take(&mut *self.pipes.lock().expect("system pipes poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Spawns `fut` as a pipe of `core`, emitting `on_failure(message)` into
/// `core`'s own queue via `emit_failure` if the pipe future returns an
/// error. `emit_failure` is passed in rather than hard-coded because each
/// System wraps its events in its own enum (spec.md §4.1's "the System
/// emits a distinguished PipeFailure marker that listen surfaces").
pub fn spawn_pipe<F, Fail>(
    pipes: &SystemCore<impl Send + 'static>,
    fut: F,
    emit_failure: Fail,
) where
    F: std::future::Future<Output = Result<(), String>> + Send + 'static,
    Fail: FnOnce(PipeFailure) + Send + 'static,
{
    let handle = tokio::spawn(async move {
        if let Err(message) = fut.await {
            emit_failure(PipeFailure(message));
        }
    });
    pipes.add_pipe(handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listen_twice_is_an_error() {
        let core: SystemCore<i32> = SystemCore::new("test", Uuid::new_v4());
        assert!(core.listen().is_ok());
        assert!(core.listen().is_err());
    }

    #[tokio::test]
    async fn emit_is_fifo_for_a_single_consumer() {
        let core: SystemCore<i32> = SystemCore::new("test", Uuid::new_v4());
        let mut rx = core.listen().unwrap();
        core.emit(1);
        core.emit(2);
        core.emit(3);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn emit_after_stop_is_a_no_op() {
        let core: SystemCore<i32> = SystemCore::new("test", Uuid::new_v4());
        let mut rx = core.listen().unwrap();
        core.stop().await;
        core.emit(1);
        drop(core);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    #[should_panic(expected = "duplicate System registration")]
    fn duplicate_registration_is_fatal() {
        let id = Uuid::new_v4();
        let _a = Registration::new("dup-test", id);
        let _b = Registration::new("dup-test", id);
    }
}
