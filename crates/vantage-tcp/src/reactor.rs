//! Worker reactor pool.
//!
//! The [`Reactor`] owns a fixed set of workers, each with its own poller
//! and shutdown notifier, each running an independent event loop on its
//! own OS thread. Handler *kinds* are registered before the pool starts;
//! the reactor produces one live instance per worker by asking the
//! template to clone itself ([`WorkerHandler::clone_for_worker`]) and
//! registers the instance's wakeup descriptor with that worker's poller
//! under a tag that carries the kind's [`HandlerKey`] in its upper bits.
//!
//! [`Reactor::handlers`] returns the per-worker instances in worker
//! order, and that order is stable for the reactor's lifetime; the
//! listener's `fd % N` dispatch depends on it.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::notifier::ShutdownNotifier;
use crate::poller::{Event, Poller, POLL_BATCH};

/// Token identifying a registered handler kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerKey(usize);

impl HandlerKey {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// A handler kind hosted by the reactor, one instance per worker.
///
/// Instances are internally synchronized: the owning worker drives
/// [`on_ready`](WorkerHandler::on_ready) while other threads enqueue work
/// through the instance's own channels.
pub trait WorkerHandler: Send + Sync + 'static {
    /// Produces the live instance for `worker` from this template.
    fn clone_for_worker(&self, worker: usize) -> Result<Arc<dyn WorkerHandler>>;

    /// Registers the instance's wakeup descriptors with its worker's
    /// poller, tagging them with `key` so the worker loop can route
    /// events back.
    fn register(&self, poller: &Poller, key: HandlerKey) -> Result<()>;

    /// One of this instance's tags fired.
    fn on_ready(&self, event: &Event);

    /// Downcast support for callers that know the concrete kind.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// CPU affinity request for one worker. Reserved: accepted and validated,
/// not yet applied.
#[derive(Debug, Clone, Default)]
pub struct CpuSet {
    cpus: Vec<usize>,
}

impl CpuSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, cpu: usize) -> &mut Self {
        if !self.cpus.contains(&cpu) {
            self.cpus.push(cpu);
        }
        self
    }

    #[must_use]
    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }
}

struct Worker {
    index: usize,
    poller: Poller,
    notifier: ShutdownNotifier,
    handlers: Mutex<Vec<Arc<dyn WorkerHandler>>>,
}

/// Fixed-size pool of I/O workers with a handler-kind registry.
pub struct Reactor {
    workers: Vec<Arc<Worker>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Reactor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Allocates `worker_count` worker contexts. Called once, before
    /// [`run`](Reactor::run).
    pub fn init(&mut self, worker_count: usize) -> Result<()> {
        if worker_count == 0 {
            return Err(Error::NoWorkers);
        }
        if !self.workers.is_empty() {
            return Err(Error::ReactorConfig);
        }
        for index in 0..worker_count {
            let poller = Poller::new()?;
            let notifier = ShutdownNotifier::new();
            notifier.bind(&poller)?;
            self.workers.push(Arc::new(Worker {
                index,
                poller,
                notifier,
                handlers: Mutex::new(Vec::new()),
            }));
        }
        Ok(())
    }

    /// Number of allocated workers; zero before [`init`](Reactor::init).
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Registers a handler kind: one instance is produced and registered
    /// per worker. Callable before [`run`](Reactor::run) only.
    pub fn add_handler(&self, template: &dyn WorkerHandler) -> Result<HandlerKey> {
        if self.workers.is_empty() || self.started.load(Ordering::Acquire) {
            return Err(Error::ReactorConfig);
        }
        let key = HandlerKey(self.workers[0].handlers.lock().len());
        // Stage every instance before touching the registries, so a
        // failed clone or registration commits nothing and the per-worker
        // sequences keep identical lengths. A dropped staged instance
        // closes its wakeup descriptor, which also deregisters it.
        let mut instances = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let instance = template.clone_for_worker(worker.index)?;
            instance.register(&worker.poller, key)?;
            instances.push(instance);
        }
        for (worker, instance) in self.workers.iter().zip(instances) {
            worker.handlers.lock().push(instance);
        }
        Ok(key)
    }

    /// The per-worker instances of `key`, in worker order. The order and
    /// the per-position identity are stable across calls.
    #[must_use]
    pub fn handlers(&self, key: HandlerKey) -> Vec<Arc<dyn WorkerHandler>> {
        self.workers
            .iter()
            .filter_map(|worker| worker.handlers.lock().get(key.index()).cloned())
            .collect()
    }

    /// Starts one event-loop thread per worker.
    pub fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut threads = self.threads.lock();
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let handle = std::thread::Builder::new()
                .name(format!("vantage-io-{}", worker.index))
                .spawn(move || worker_loop(&worker))
                .map_err(Error::Io)?;
            threads.push(handle);
        }
        Ok(())
    }

    /// Asks every worker to exit its loop and joins the threads.
    /// Idempotent.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.notifier.notify();
        }
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("reactor worker panicked during shutdown");
            }
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker: &Worker) {
    let mut events = Vec::with_capacity(POLL_BATCH);
    loop {
        match worker.poller.poll(&mut events, POLL_BATCH, None) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!(worker = worker.index, error = %err, "worker poll failed");
                return;
            }
        }

        // The batch may carry both work and the stop signal; stop wins.
        if events.iter().any(|event| event.tag == worker.notifier.tag()) {
            tracing::debug!(worker = worker.index, "worker shutting down");
            return;
        }

        for event in &events {
            let handler = worker
                .handlers
                .lock()
                .get(event.tag.handler_key())
                .cloned();
            if let Some(handler) = handler {
                handler.on_ready(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer;
    use crate::transport::{ConnectionHandler, Transport};
    use std::time::Duration;

    struct NullHandler;

    impl ConnectionHandler for NullHandler {
        fn on_connection(&self, _peer: &Peer) {}
    }

    fn transport_template() -> Transport {
        Transport::new(Arc::new(NullHandler)).expect("transport")
    }

    #[test]
    fn init_allocates_the_requested_workers() {
        let mut reactor = Reactor::new();
        reactor.init(3).expect("init");
        assert_eq!(reactor.worker_count(), 3);
    }

    #[test]
    fn init_twice_is_rejected() {
        let mut reactor = Reactor::new();
        reactor.init(1).expect("init");
        assert!(matches!(reactor.init(1), Err(Error::ReactorConfig)));
    }

    #[test]
    fn init_rejects_zero_workers() {
        let mut reactor = Reactor::new();
        assert!(matches!(reactor.init(0), Err(Error::NoWorkers)));
        assert_eq!(reactor.worker_count(), 0);
    }

    #[test]
    fn add_handler_before_init_is_rejected() {
        let reactor = Reactor::new();
        let template = transport_template();
        assert!(matches!(
            reactor.add_handler(&template),
            Err(Error::ReactorConfig)
        ));
    }

    #[test]
    fn handlers_are_stable_across_calls() {
        let mut reactor = Reactor::new();
        reactor.init(4).expect("init");
        let template = transport_template();
        let key = reactor.add_handler(&template).expect("add_handler");

        let first = reactor.handlers(key);
        let second = reactor.handlers(key);
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        for (a, b) in first.iter().zip(&second) {
            assert!(Arc::ptr_eq(a, b), "per-position identity must be stable");
        }
    }

    #[test]
    fn each_worker_gets_its_own_instance() {
        let mut reactor = Reactor::new();
        reactor.init(2).expect("init");
        let template = transport_template();
        let key = reactor.add_handler(&template).expect("add_handler");

        let handlers = reactor.handlers(key);
        assert!(!Arc::ptr_eq(&handlers[0], &handlers[1]));

        let indices: Vec<usize> = handlers
            .into_iter()
            .map(|h| {
                h.as_any()
                    .downcast::<Transport>()
                    .expect("transport kind")
                    .worker_index()
            })
            .collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn workers_answer_load_requests_once_running() {
        let mut reactor = Reactor::new();
        reactor.init(2).expect("init");
        let template = transport_template();
        let key = reactor.add_handler(&template).expect("add_handler");
        reactor.run().expect("run");

        for handler in reactor.handlers(key) {
            let transport = handler
                .as_any()
                .downcast::<Transport>()
                .expect("transport kind");
            let usage = transport.load().wait().expect("load");
            assert!(usage.user() + usage.system() < Duration::from_secs(3600));
        }

        reactor.shutdown();
        reactor.shutdown(); // idempotent
    }

    /// Clones successfully for worker 0, fails for every other worker.
    struct FlakyTemplate;

    impl WorkerHandler for FlakyTemplate {
        fn clone_for_worker(&self, worker: usize) -> Result<Arc<dyn WorkerHandler>> {
            if worker == 0 {
                transport_template().clone_for_worker(0)
            } else {
                Err(Error::ReactorConfig)
            }
        }

        fn register(&self, _poller: &Poller, _key: HandlerKey) -> Result<()> {
            Ok(())
        }

        fn on_ready(&self, _event: &Event) {}

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn a_failed_registration_commits_nothing() {
        let mut reactor = Reactor::new();
        reactor.init(2).expect("init");
        assert!(reactor.add_handler(&FlakyTemplate).is_err());

        // No worker kept a partial entry: the next kind still occupies
        // the first slot on every worker and comes back full length.
        let key = reactor
            .add_handler(&transport_template())
            .expect("add_handler");
        let handlers = reactor.handlers(key);
        assert_eq!(handlers.len(), 2);
        let indices: Vec<usize> = handlers
            .into_iter()
            .map(|h| {
                h.as_any()
                    .downcast::<Transport>()
                    .expect("transport kind")
                    .worker_index()
            })
            .collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn cpu_set_deduplicates_and_reports_cpus() {
        let mut set = CpuSet::new();
        set.set(0).set(2);
        set.set(2);
        assert_eq!(set.cpus(), &[0, 2]);
    }

    #[test]
    fn second_handler_kind_gets_a_distinct_key() {
        let mut reactor = Reactor::new();
        reactor.init(1).expect("init");
        let key_a = reactor
            .add_handler(&transport_template())
            .expect("add_handler");
        let key_b = reactor
            .add_handler(&transport_template())
            .expect("add_handler");
        assert_ne!(key_a, key_b);
        assert_eq!(reactor.handlers(key_a).len(), 1);
        assert_eq!(reactor.handlers(key_b).len(), 1);
    }
}
