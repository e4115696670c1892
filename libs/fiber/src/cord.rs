// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cords: OS threads hosting one scheduler each.
//!
//! A cord owns its event loop, the fiber registry, the FIFO ready queue, the
//! dead pool of recyclable fibers, a one-shot timer heap, and the injector —
//! the loop's only cross-thread wake source. Each loop iteration drains the
//! injector, runs the ready queue as one batch (fibers woken during a batch
//! run in the next one, preserving FIFO order across wakeups), fires due
//! timers, and parks until the next deadline or unpark.
//!
//! Cords share no fiber state. The only cross-cord channels are posting a
//! wakeup through another cord's injector and the one-shot exit slot used by
//! [`CordHandle::cojoin`], which resolves the install/exit race with a single
//! atomic compare-exchange.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread::Thread;
use std::time::Instant;

use futures::task::{waker, ArcWake};
use hashbrown::HashMap;
use loam_error::{Error, Result};
use static_assertions::assert_impl_all;

use crate::fiber::{Fiber, FiberBody, FiberFlags, FiberId};
use crate::trigger::TriggerList;

pub(crate) const MAIN_FIBER_ID: FiberId = FiberId(1);
const USER_FIBER_ID_MIN: u64 = 101;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Cord>>> = const { RefCell::new(None) };
}

/// Run `f` with this thread's cord.
///
/// # Panics
///
/// Panics when no cord runs on this thread.
pub(crate) fn with_current<R>(f: impl FnOnce(&Cord) -> R) -> R {
    CURRENT.with(|c| {
        let slot = c.borrow();
        let cord = slot.as_ref().expect("not running inside a cord");
        f(cord)
    })
}

pub(crate) fn try_with_current<R>(f: impl FnOnce(&Cord) -> R) -> Option<R> {
    CURRENT.with(|c| {
        let slot = c.borrow();
        slot.as_ref().map(|cord| f(cord))
    })
}

/// Name of the current cord.
///
/// # Panics
///
/// Panics when no cord runs on this thread.
pub fn name() -> String {
    with_current(|cord| cord.name.clone())
}

/// Cross-thread wake source: fiber ids posted here are drained into the
/// ready queue once per loop iteration.
pub(crate) struct Inject {
    queue: Mutex<VecDeque<FiberId>>,
    thread: Thread,
}

// === impl Inject ===

impl Inject {
    fn post(&self, id: FiberId) {
        self.queue
            .lock()
            .expect("fiber injector lock poisoned")
            .push_back(id);
        self.thread.unpark();
    }

    fn drain(&self) -> Vec<FiberId> {
        let mut q = self.queue.lock().expect("fiber injector lock poisoned");
        q.drain(..).collect()
    }

    fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .expect("fiber injector lock poisoned")
            .is_empty()
    }
}

struct RemoteWaker {
    id: FiberId,
    inject: Arc<Inject>,
}

impl ArcWake for RemoteWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.inject.post(arc_self.id);
    }
}

#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    armed: HashMap<u64, FiberId>,
    next_token: u64,
}

pub(crate) struct Cord {
    name: String,
    registry: RefCell<HashMap<FiberId, Rc<Fiber>>>,
    ready: RefCell<VecDeque<FiberId>>,
    dead_pool: RefCell<Vec<Rc<Fiber>>>,
    next_id: Cell<u64>,
    /// Running fiber id; 0 means the scheduler itself.
    current: Cell<u64>,
    timers: RefCell<Timers>,
    inject: Arc<Inject>,
}

// === impl Cord ===

impl Cord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            registry: RefCell::new(HashMap::new()),
            ready: RefCell::new(VecDeque::new()),
            dead_pool: RefCell::new(Vec::new()),
            next_id: Cell::new(USER_FIBER_ID_MIN),
            current: Cell::new(0),
            timers: RefCell::new(Timers::default()),
            inject: Arc::new(Inject {
                queue: Mutex::new(VecDeque::new()),
                thread: std::thread::current(),
            }),
        }
    }

    pub(crate) fn lookup(&self, id: FiberId) -> Option<Rc<Fiber>> {
        self.registry.borrow().get(&id).cloned()
    }

    pub(crate) fn current_id(&self) -> FiberId {
        FiberId(self.current.get())
    }

    /// The running fiber.
    ///
    /// # Panics
    ///
    /// Panics in scheduler context (between fibers).
    pub(crate) fn current_fiber(&self) -> Rc<Fiber> {
        self.lookup(self.current_id())
            .expect("not in fiber context")
    }

    pub(crate) fn spawn(
        &self,
        name: &str,
        capacity: Option<usize>,
        joinable: bool,
        body: FiberBody,
    ) -> Result<Rc<Fiber>> {
        let id = FiberId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let fiber = match capacity {
            None => self
                .dead_pool
                .borrow_mut()
                .pop()
                .unwrap_or_else(|| Rc::new(Fiber::new_default())),
            Some(cap) => Rc::new(Fiber::new_custom(cap)),
        };
        let fiber_waker = waker(Arc::new(RemoteWaker {
            id,
            inject: self.inject.clone(),
        }));
        fiber.prepare(id, name, joinable, capacity.is_some(), body, fiber_waker);

        self.registry.borrow_mut().insert(id, fiber.clone());
        self.wakeup(&fiber);
        tracing::trace!(fiber = %id, name, "spawned fiber");
        Ok(fiber)
    }

    fn spawn_main(&self, body: FiberBody) {
        let fiber = Rc::new(Fiber::new_default());
        let fiber_waker = waker(Arc::new(RemoteWaker {
            id: MAIN_FIBER_ID,
            inject: self.inject.clone(),
        }));
        fiber.prepare(MAIN_FIBER_ID, "main", false, false, body, fiber_waker);
        self.registry.borrow_mut().insert(MAIN_FIBER_ID, fiber.clone());
        self.wakeup(&fiber);
    }

    /// Append to the tail of the ready queue; no-op when READY or DEAD.
    pub(crate) fn wakeup(&self, fiber: &Fiber) {
        let flags = fiber.flags();
        if flags.contains(FiberFlags::READY) || flags.contains(FiberFlags::DEAD) {
            return;
        }
        fiber.add_flags(FiberFlags::READY);
        self.ready.borrow_mut().push_back(fiber.id());
    }

    pub(crate) fn wakeup_id(&self, id: FiberId) {
        if let Some(fiber) = self.lookup(id) {
            self.wakeup(&fiber);
        }
    }

    pub(crate) fn wakeup_current(&self) {
        let fiber = self.current_fiber();
        self.wakeup(&fiber);
    }

    pub(crate) fn cancel_fiber(&self, fiber: &Fiber) {
        fiber.add_flags(FiberFlags::CANCELLED);
        if fiber.flags().contains(FiberFlags::CANCELLABLE) {
            self.wakeup(fiber);
        }
    }

    // --- timers ---

    pub(crate) fn arm_timer(&self, deadline: Instant, fiber: FiberId) -> u64 {
        let mut timers = self.timers.borrow_mut();
        let token = timers.next_token;
        timers.next_token += 1;
        timers.heap.push(Reverse((deadline, token)));
        timers.armed.insert(token, fiber);
        token
    }

    pub(crate) fn disarm_timer(&self, token: u64) -> bool {
        self.timers.borrow_mut().armed.remove(&token).is_some()
    }

    pub(crate) fn timer_is_armed(&self, token: u64) -> bool {
        self.timers.borrow().armed.contains_key(&token)
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let mut fired = Vec::new();
        {
            let mut timers = self.timers.borrow_mut();
            while let Some(Reverse((deadline, token))) = timers.heap.peek().copied() {
                if deadline > now {
                    break;
                }
                timers.heap.pop();
                if let Some(fiber) = timers.armed.remove(&token) {
                    fired.push(fiber);
                }
            }
        }
        for fiber in fired {
            tracing::trace!(fiber = %fiber, "timer fired");
            self.wakeup_id(fiber);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut timers = self.timers.borrow_mut();
        while let Some(Reverse((deadline, token))) = timers.heap.peek().copied() {
            if timers.armed.contains_key(&token) {
                return Some(deadline);
            }
            // disarmed entries are dropped lazily
            timers.heap.pop();
        }
        None
    }

    // --- the loop ---

    fn drain_inject(&self) {
        for id in self.inject.drain() {
            self.wakeup_id(id);
        }
    }

    /// Run the current ready queue as one batch. Fibers woken while the
    /// batch runs land in the next batch.
    fn run_batch(&self) {
        let batch: Vec<FiberId> = self.ready.borrow_mut().drain(..).collect();
        for id in batch {
            let Some(fiber) = self.lookup(id) else {
                continue;
            };
            if fiber.flags().contains(FiberFlags::DEAD) {
                continue;
            }
            fiber.remove_flags(FiberFlags::READY);
            self.current.set(id.0);
            let poll = fiber.poll_body();
            self.current.set(0);
            match poll {
                Poll::Pending => run_triggers(&fiber.on_yield, false),
                Poll::Ready(res) => self.finish(&fiber, res),
            }
        }
    }

    fn finish(&self, fiber: &Rc<Fiber>, res: Result<()>) {
        tracing::trace!(fiber = %fiber.id(), ok = res.is_ok(), "fiber finished");
        fiber.add_flags(FiberFlags::DEAD);
        fiber.remove_flags(FiberFlags::READY);
        fiber.set_diag(res.err());

        run_triggers(&fiber.on_stop, true);

        for waiter in fiber.drain_waiters() {
            self.wakeup_id(waiter);
        }

        if !fiber.flags().contains(FiberFlags::JOINABLE) {
            if let Some(e) = fiber.diag.borrow().as_ref() {
                tracing::warn!(fiber = %fiber.id(), name = %fiber.name.borrow(), error = %e, "fiber failed");
            }
            self.reclaim(fiber);
        }
    }

    /// Remove a dead fiber from the registry; default-arena fibers go back
    /// to the dead pool for reuse.
    pub(crate) fn reclaim(&self, fiber: &Rc<Fiber>) {
        self.registry.borrow_mut().remove(&fiber.id());
        if fiber.flags().contains(FiberFlags::CUSTOM_ARENA) {
            return;
        }
        fiber.reset_for_pool();
        self.dead_pool.borrow_mut().push(fiber.clone());
    }

    #[cfg(test)]
    fn dead_pool_len(&self) -> usize {
        self.dead_pool.borrow().len()
    }
}

/// Run a trigger list with take-out/put-back slots so callbacks may add and
/// remove triggers, including themselves. Failures are logged and dropped.
fn run_triggers(list: &RefCell<TriggerList>, reverse: bool) {
    let ids = list.borrow().ids(reverse);
    for id in ids {
        let Some(mut cb) = list.borrow_mut().take(id) else {
            continue;
        };
        let res = cb();
        list.borrow_mut().put_back(id, cb);
        if let Err(e) = res {
            tracing::warn!(error = %e, "fiber trigger failed");
        }
    }
}

struct CurrentGuard;

impl CurrentGuard {
    fn install(cord: Rc<Cord>) -> Self {
        CURRENT.with(|c| {
            let mut slot = c.borrow_mut();
            assert!(slot.is_none(), "a cord is already running on this thread");
            *slot = Some(cord);
        });
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.borrow_mut().take());
    }
}

/// Install a cord on the current thread and drive `main` as its main fiber
/// (id 1) together with every fiber it spawns, until `main` completes. The
/// remaining fibers are dropped with the cord.
///
/// # Panics
///
/// Panics when a cord is already running on this thread.
pub fn run<F>(name: &str, main: F) -> F::Output
where
    F: Future + 'static,
    F::Output: 'static,
{
    let cord = Rc::new(Cord::new(name));
    let _guard = CurrentGuard::install(cord.clone());
    let _span = tracing::debug_span!("cord", name).entered();

    let out: Rc<RefCell<Option<F::Output>>> = Rc::new(RefCell::new(None));
    let out2 = out.clone();
    let body: FiberBody = Box::pin(async move {
        *out2.borrow_mut() = Some(main.await);
        Ok(())
    });
    cord.spawn_main(body);

    loop {
        cord.drain_inject();
        cord.run_batch();
        if out.borrow().is_some() {
            break;
        }
        cord.fire_timers();
        if !cord.ready.borrow().is_empty() || !cord.inject.is_empty() {
            continue;
        }
        match cord.next_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    tracing::trace!("parking until next timer");
                    std::thread::park_timeout(deadline - now);
                }
            }
            None => {
                tracing::trace!("parking");
                std::thread::park();
            }
        }
    }

    let value = out.borrow_mut().take();
    value.expect("main fiber finished without a result")
}

const EXIT_EMPTY: u8 = 0;
const EXIT_WAITING: u8 = 1;
const EXIT_FINISHED: u8 = 2;
const EXIT_ABANDONED: u8 = 3;

/// One-shot exit publication slot shared between a cord and at most one
/// waiter. The compare-exchange between EMPTY and the other states resolves
/// the race between "waiter installed before the cord exits" and "cord exits
/// before the waiter installs".
struct ExitSlot {
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
}

// === impl ExitSlot ===

impl ExitSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EXIT_EMPTY),
            waker: Mutex::new(None),
        }
    }

    /// Called by the exiting cord thread, exactly once.
    fn finish(&self) {
        match self.state.compare_exchange(
            EXIT_EMPTY,
            EXIT_FINISHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(EXIT_WAITING) => {
                self.state.store(EXIT_FINISHED, Ordering::Release);
                let waker = self.waker.lock().expect("exit slot lock poisoned").take();
                if let Some(w) = waker {
                    w.wake();
                }
            }
            // abandoned: a blocking join will reap the thread
            Err(_) => {}
        }
    }

    /// Called by a blocking joiner: the cojoin handler will not run.
    fn abandon(&self) {
        let _ = self.state.compare_exchange(
            EXIT_EMPTY,
            EXIT_ABANDONED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXIT_FINISHED
    }

    fn register(&self, w: &Waker) {
        *self.waker.lock().expect("exit slot lock poisoned") = Some(w.clone());
        let _ = self.state.compare_exchange(
            EXIT_EMPTY,
            EXIT_WAITING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Handle to a started cord.
pub struct CordHandle<T> {
    thread: Option<std::thread::JoinHandle<T>>,
    exit: Arc<ExitSlot>,
    name: String,
}

assert_impl_all!(CordHandle<u32>: Send);

/// Start an OS thread hosting its own cord; the thread runs `entry()` as the
/// cord's main fiber and publishes its termination to at most one waiter.
///
/// # Errors
///
/// Fails with [`Error::System`] when the thread cannot be created.
pub fn start<T, F, Fut>(name: &str, entry: F) -> Result<CordHandle<T>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + 'static,
    T: Send + 'static,
{
    let exit = Arc::new(ExitSlot::new());
    let exit2 = exit.clone();
    let run_name = name.to_string();
    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let out = run(&run_name, entry());
            exit2.finish();
            out
        })
        .map_err(|e| Error::System(format!("failed to start cord '{name}': {e}")))?;

    Ok(CordHandle {
        thread: Some(thread),
        exit,
        name: name.to_string(),
    })
}

// === impl CordHandle ===

impl<T> CordHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocking OS join; usable outside fiber context.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::System`] when the cord panicked.
    pub fn join(mut self) -> Result<T> {
        self.exit.abandon();
        let thread = self
            .thread
            .take()
            .ok_or_else(|| Error::System("cord already joined".into()))?;
        thread
            .join()
            .map_err(|_| Error::System(format!("cord '{}' panicked", self.name)))
    }

    /// Cooperative join: the calling fiber waits (non-cancellably) for the
    /// cord's exit event without blocking its own loop, then reaps the
    /// thread. Returns the same value as [`join`](Self::join).
    ///
    /// # Errors
    ///
    /// Fails with [`Error::System`] when the cord panicked.
    ///
    /// # Panics
    ///
    /// Panics outside fiber context.
    pub async fn cojoin(mut self) -> Result<T> {
        let prev = crate::fiber::cancellable(false);
        ExitWait {
            exit: self.exit.clone(),
        }
        .await;
        crate::fiber::cancellable(prev);

        let thread = self
            .thread
            .take()
            .ok_or_else(|| Error::System("cord already joined".into()))?;
        thread
            .join()
            .map_err(|_| Error::System(format!("cord '{}' panicked", self.name)))
    }
}

struct ExitWait {
    exit: Arc<ExitSlot>,
}

impl Future for ExitWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.exit.is_finished() {
            return Poll::Ready(());
        }
        self.exit.register(cx.waker());
        // re-check: the cord may have exited between the fast path and the
        // waker install
        if self.exit.is_finished() {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{self, Builder};
    use std::cell::Cell;
    use std::time::Duration;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    fn trace() -> impl Drop {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .set_default()
    }

    #[test]
    fn run_returns_the_main_value() {
        let _trace = trace();
        let out = run("t", async { 7u32 });
        assert_eq!(out, 7);
    }

    #[test]
    fn dead_fibers_are_recycled_through_the_pool() {
        let _trace = trace();
        run("t", async {
            let h = fiber::spawn("short", async { Ok(()) }).unwrap();
            let first_id = h.id();
            fiber::yield_now().await.unwrap();
            assert_eq!(with_current(Cord::dead_pool_len), 1);

            let h2 = fiber::spawn("reuse", async {
                fiber::suspend().await?;
                Ok(())
            })
            .unwrap();
            // the pool slot was taken over: same cell, fresh identity
            assert_eq!(with_current(Cord::dead_pool_len), 0);
            assert!(Rc::ptr_eq(&h.f, &h2.f));
            assert_ne!(first_id, h2.id());

            h2.wakeup();
            let _ = fiber::yield_now().await;
        });
    }

    #[test]
    fn custom_arena_fibers_are_not_pooled() {
        let _trace = trace();
        run("t", async {
            Builder::new()
                .name("fat")
                .arena_capacity(128 * 1024)
                .spawn(async { Ok(()) })
                .unwrap();
            fiber::yield_now().await.unwrap();
            assert_eq!(with_current(Cord::dead_pool_len), 0);
        });
    }

    #[test]
    fn user_fiber_ids_start_past_the_reserved_range() {
        let _trace = trace();
        run("t", async {
            assert_eq!(fiber::self_id(), FiberId(1));
            let h = fiber::spawn("user", async { Ok(()) }).unwrap();
            assert!(h.id().as_u64() >= 101);
            fiber::yield_now().await.unwrap();
        });
    }

    #[test]
    fn cord_name_is_visible() {
        let _trace = trace();
        run("named-cord", async {
            assert_eq!(name(), "named-cord");
        });
    }

    #[test]
    fn cord_join_returns_the_entry_value() {
        let _trace = trace();
        let handle = start("worker", || async { 41u32 + 1 }).unwrap();
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn cojoin_matches_join_and_destroys_the_cord() {
        let _trace = trace();
        let out = run("main", async {
            let handle = start("worker", || async {
                fiber::sleep(Duration::from_millis(50)).await.unwrap();
                42u32
            })
            .unwrap();
            handle.cojoin().await.unwrap()
        });
        assert_eq!(out, 42);
    }

    #[test]
    fn cojoin_does_not_block_the_callers_loop() {
        let _trace = trace();
        let (value, ticks) = run("main", async {
            let handle = start("worker", || async {
                fiber::sleep(Duration::from_millis(50)).await.unwrap();
                42u32
            })
            .unwrap();

            let ticks = Rc::new(Cell::new(0u32));
            let t2 = ticks.clone();
            fiber::spawn("ticker", async move {
                for _ in 0..5 {
                    t2.set(t2.get() + 1);
                    fiber::sleep(Duration::from_millis(5)).await?;
                }
                Ok(())
            })
            .unwrap();

            let value = handle.cojoin().await.unwrap();
            (value, ticks.get())
        });
        assert_eq!(value, 42);
        assert!(ticks >= 4, "caller loop stalled during cojoin: {ticks} ticks");
    }

    #[test]
    fn cojoin_after_exit_completes_immediately() {
        let _trace = trace();
        let out = run("main", async {
            let handle = start("quick", || async { 5u8 }).unwrap();
            // give the worker ample time to exit before waiting
            fiber::sleep(Duration::from_millis(50)).await.unwrap();
            handle.cojoin().await.unwrap()
        });
        assert_eq!(out, 5);
    }

    #[test]
    fn exit_slot_race_is_one_shot() {
        let slot = Arc::new(ExitSlot::new());
        slot.abandon();
        // finishing after abandon must not wake anything or flip the state
        slot.finish();
        assert!(!slot.is_finished());

        let slot = Arc::new(ExitSlot::new());
        slot.finish();
        assert!(slot.is_finished());
    }
}
