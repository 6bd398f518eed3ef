//! Admission control: bounded queues that decide when a ready pip may run.
//!
//! A queue hands admitted pips to a shared rayon pool and reports each
//! completion as a `FinishedPip` over a channel, so the scheduler loop owns
//! all follow-up work (enqueueing dependents, calling `start_tasks` again).
//! `NestedDispatcherQueue` keeps one independent queue per worker and routes
//! pips by their preferred worker; no balancing happens across workers.

use crate::pip::{Pip, PipId};
use anyhow::anyhow;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::debug;

/// The stage of pip processing a queue serves.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DispatcherKind {
    CacheLookup,
    Cpu,
    Light,
    Io,
    Materialize,
}

#[derive(Debug, Copy, Clone)]
pub struct DispatcherConfig {
    pub kind: DispatcherKind,
    pub max_parallel_degree: usize,
}

pub type PipWork = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// A pip whose dependencies are done, with the work to run for it.
pub struct RunnablePip {
    pub pip: PipId,
    pub preferred_worker: Option<u32>,
    /// Higher runs first.
    pub priority: u32,
    pub work: PipWork,
}

impl RunnablePip {
    pub fn new(pip: PipId, work: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> Self {
        RunnablePip {
            pip,
            preferred_worker: None,
            priority: 0,
            work: Box::new(work),
        }
    }

    /// Runnable form of a graph pip, carrying its worker affinity.
    pub fn for_pip(
        id: PipId,
        pip: &Pip,
        work: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        RunnablePip {
            preferred_worker: pip.preferred_worker(),
            ..RunnablePip::new(id, work)
        }
    }
}

impl std::fmt::Debug for RunnablePip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnablePip")
            .field("pip", &self.pip)
            .field("preferred_worker", &self.preferred_worker)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

pub struct FinishedPip {
    pub pip: PipId,
    pub kind: DispatcherKind,
    pub worker: u32,
    /// A (faked) "thread id", used to put concurrently running pips on
    /// different tracks in a performance trace.
    pub tid: usize,
    pub span: (Instant, Instant),
    pub result: anyhow::Result<()>,
}

/// Tracks faked "thread ids": small integers handed to running pips.
#[derive(Default)]
pub struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}

impl ThreadIds {
    pub fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(true);
                idx
            }
        }
    }

    pub fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

/// What all queues of one scheduler share: the pool pips run on, the
/// completion channel, and trace thread ids.
#[derive(Clone)]
pub struct DispatchContext {
    pool: Arc<rayon::ThreadPool>,
    finished: mpsc::Sender<FinishedPip>,
    tids: Arc<Mutex<ThreadIds>>,
}

impl DispatchContext {
    pub fn new(threads: usize) -> anyhow::Result<(Self, mpsc::Receiver<FinishedPip>)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("pip-worker-{}", i))
            .build()
            .map_err(|err| anyhow!("thread pool: {}", err))?;
        let (tx, rx) = mpsc::channel();
        Ok((
            DispatchContext {
                pool: Arc::new(pool),
                finished: tx,
                tids: Arc::new(Mutex::new(ThreadIds::default())),
            },
            rx,
        ))
    }
}

/// Occupancy counters are read under the queue's lock, so concurrent
/// enqueues never lose entries or double count slots.
pub trait DispatcherQueue: Send + Sync {
    /// Adds a ready pip.  Panics if the queue was disposed.
    fn enqueue(&self, pip: RunnablePip);
    /// Admits queued pips while slots are free.
    fn start_tasks(&self);
    /// Changes the slot limit.  Returns false if the change was refused.
    fn adjust_parallel_degree(&self, degree: usize) -> bool;
    fn num_acquired_slots(&self) -> usize;
    fn num_running_pips(&self) -> usize;
    fn num_queued(&self) -> usize;
    fn max_parallel_degree(&self) -> usize;
    fn is_disposed(&self) -> bool;
    /// Stops admitting work and drops everything still queued.  Pips already
    /// admitted run to completion.
    fn dispose(&self);
}

struct Queued {
    priority: u32,
    seq: u64,
    pip: RunnablePip,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    /// Max-heap order: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    queued: BinaryHeap<Queued>,
    next_seq: u64,
    acquired: usize,
    running: usize,
    max_parallel_degree: usize,
    disposed: bool,
}

/// One bounded queue.
pub struct SimpleDispatcherQueue {
    kind: DispatcherKind,
    worker: u32,
    state: Arc<Mutex<QueueState>>,
    context: DispatchContext,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Pip work runs outside the lock, so a poisoned lock means a bug in
    // this module; the counters themselves are still consistent.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimpleDispatcherQueue {
    pub fn new(config: DispatcherConfig, worker: u32, context: DispatchContext) -> Self {
        SimpleDispatcherQueue {
            kind: config.kind,
            worker,
            state: Arc::new(Mutex::new(QueueState {
                queued: BinaryHeap::new(),
                next_seq: 0,
                acquired: 0,
                running: 0,
                max_parallel_degree: config.max_parallel_degree,
                disposed: false,
            })),
            context,
        }
    }

    fn spawn(&self, pip: RunnablePip) {
        let state = self.state.clone();
        let context = self.context.clone();
        let kind = self.kind;
        let worker = self.worker;
        let tid = lock(&context.tids).claim();
        self.context.pool.spawn(move || {
            lock(&state).running += 1;
            let start = Instant::now();
            let RunnablePip { pip: id, work, .. } = pip;
            let result = std::panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|_| Err(anyhow!("pip work panicked")));
            let end = Instant::now();
            {
                let mut state = lock(&state);
                state.running -= 1;
                state.acquired -= 1;
            }
            lock(&context.tids).release(tid);
            // The send will only fail if the receiver disappeared, e.g. due
            // to shutting down.
            let _ = context.finished.send(FinishedPip {
                pip: id,
                kind,
                worker,
                tid,
                span: (start, end),
                result,
            });
        });
    }
}

impl DispatcherQueue for SimpleDispatcherQueue {
    fn enqueue(&self, pip: RunnablePip) {
        let mut state = lock(&self.state);
        assert!(
            !state.disposed,
            "enqueue of {:?} into disposed {:?} queue",
            pip.pip,
            self.kind
        );
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queued.push(Queued {
            priority: pip.priority,
            seq,
            pip,
        });
    }

    fn start_tasks(&self) {
        let admitted: Vec<RunnablePip> = {
            let mut state = lock(&self.state);
            let mut admitted = Vec::new();
            while !state.disposed && state.acquired < state.max_parallel_degree {
                match state.queued.pop() {
                    None => break,
                    Some(q) => {
                        state.acquired += 1;
                        admitted.push(q.pip);
                    }
                }
            }
            admitted
        };
        for pip in admitted {
            self.spawn(pip);
        }
    }

    fn adjust_parallel_degree(&self, degree: usize) -> bool {
        let mut state = lock(&self.state);
        if degree == 0 || state.disposed {
            return false;
        }
        if state.max_parallel_degree != degree {
            debug!(
                kind = ?self.kind,
                worker = self.worker,
                from = state.max_parallel_degree,
                to = degree,
                "adjusting parallel degree"
            );
            state.max_parallel_degree = degree;
        }
        true
    }

    fn num_acquired_slots(&self) -> usize {
        lock(&self.state).acquired
    }

    fn num_running_pips(&self) -> usize {
        lock(&self.state).running
    }

    fn num_queued(&self) -> usize {
        lock(&self.state).queued.len()
    }

    fn max_parallel_degree(&self) -> usize {
        lock(&self.state).max_parallel_degree
    }

    fn is_disposed(&self) -> bool {
        lock(&self.state).disposed
    }

    fn dispose(&self) {
        let mut state = lock(&self.state);
        if state.disposed {
            return;
        }
        state.disposed = true;
        let dropped = state.queued.len();
        state.queued.clear();
        debug!(kind = ?self.kind, worker = self.worker, dropped, "disposed queue");
    }
}

/// One `SimpleDispatcherQueue` per worker.
pub struct NestedDispatcherQueue {
    queues: Vec<SimpleDispatcherQueue>,
}

impl NestedDispatcherQueue {
    pub fn new(config: DispatcherConfig, workers: usize, context: DispatchContext) -> Self {
        assert!(workers > 0, "nested dispatcher needs at least one worker");
        NestedDispatcherQueue {
            queues: (0..workers)
                .map(|w| SimpleDispatcherQueue::new(config, w as u32, context.clone()))
                .collect(),
        }
    }

    pub fn worker_queue(&self, worker: usize) -> &SimpleDispatcherQueue {
        &self.queues[worker]
    }

    fn sum(&self, f: impl Fn(&SimpleDispatcherQueue) -> usize) -> usize {
        self.queues.iter().map(f).sum()
    }
}

impl DispatcherQueue for NestedDispatcherQueue {
    fn enqueue(&self, pip: RunnablePip) {
        let worker = pip.preferred_worker.unwrap_or(0) as usize;
        match self.queues.get(worker) {
            Some(q) => q.enqueue(pip),
            None => panic!(
                "{:?} prefers worker {} but only {} exist",
                pip.pip,
                worker,
                self.queues.len()
            ),
        }
    }

    fn start_tasks(&self) {
        for q in &self.queues {
            q.start_tasks();
        }
    }

    fn adjust_parallel_degree(&self, degree: usize) -> bool {
        for q in &self.queues {
            q.adjust_parallel_degree(degree);
        }
        true
    }

    fn num_acquired_slots(&self) -> usize {
        self.sum(|q| q.num_acquired_slots())
    }

    fn num_running_pips(&self) -> usize {
        self.sum(|q| q.num_running_pips())
    }

    fn num_queued(&self) -> usize {
        self.sum(|q| q.num_queued())
    }

    fn max_parallel_degree(&self) -> usize {
        self.sum(|q| q.max_parallel_degree())
    }

    fn is_disposed(&self) -> bool {
        self.queues.iter().all(|q| q.is_disposed())
    }

    fn dispose(&self) {
        for q in &self.queues {
            q.dispose();
        }
    }
}
