// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fibers: the cooperative unit of execution.
//!
//! A fiber owns its body (a boxed future), a bounded name, a flag set, a
//! diagnostic slot holding at most one error, a bump arena for transient
//! allocations, trigger lists, and a wait list of joiners. The scheduler
//! polls a fiber only while its id sits in the ready queue, so a body that
//! returns `Pending` without waking anything stays parked until an explicit
//! [`wakeup`].
//!
//! Suspension points are exactly [`suspend`], [`yield_now`], [`sleep`],
//! [`Cond`](crate::fiber::Cond) waits and [`FiberHandle::join`]; cancellation
//! is observed there (and at [`test_cancel`]) and nowhere else.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use loam_arena::Arena;
use loam_error::{Error, Result};

use crate::cord::{try_with_current, with_current};
use crate::trigger::{TriggerFn, TriggerList};

pub use crate::cond::Cond;
pub use crate::trigger::TriggerId;

/// Names longer than this are truncated.
pub const FIBER_NAME_MAX: usize = 255;

/// Unique fiber identifier, monotonically increasing within a cord. Ids
/// below 100 are reserved; the main fiber of every cord has id 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub(crate) u64);

impl FiberId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FiberFlags: u8 {
        /// Queued for the next scheduler pass.
        const READY = 1 << 0;
        /// The body has returned; only joining remains.
        const DEAD = 1 << 1;
        /// Cancellation requested, not necessarily observed yet.
        const CANCELLED = 1 << 2;
        /// Cancellation is observable at suspension points.
        const CANCELLABLE = 1 << 3;
        /// Held after death until another fiber consumes the result.
        const JOINABLE = 1 << 4;
        /// Non-default arena capacity; never recycled through the dead pool.
        const CUSTOM_ARENA = 1 << 5;
    }
}

pub(crate) type FiberBody = Pin<Box<dyn Future<Output = Result<()>>>>;

pub(crate) struct Fiber {
    pub(crate) id: Cell<FiberId>,
    pub(crate) name: RefCell<String>,
    pub(crate) flags: Cell<FiberFlags>,
    pub(crate) diag: RefCell<Option<Error>>,
    pub(crate) arena: RefCell<Arena>,
    pub(crate) csw: Cell<u64>,
    pub(crate) waiters: RefCell<Vec<FiberId>>,
    pub(crate) on_yield: RefCell<TriggerList>,
    pub(crate) on_stop: RefCell<TriggerList>,
    pub(crate) body: RefCell<Option<FiberBody>>,
    pub(crate) waker: RefCell<Option<Waker>>,
}

// === impl Fiber ===

impl Fiber {
    pub(crate) fn new_default() -> Self {
        Self::with_arena(Arena::new())
    }

    pub(crate) fn new_custom(capacity: usize) -> Self {
        Self::with_arena(Arena::with_capacity(capacity))
    }

    fn with_arena(arena: Arena) -> Self {
        Self {
            id: Cell::new(FiberId(0)),
            name: RefCell::new(String::new()),
            flags: Cell::new(FiberFlags::empty()),
            diag: RefCell::new(None),
            arena: RefCell::new(arena),
            csw: Cell::new(0),
            waiters: RefCell::new(Vec::new()),
            on_yield: RefCell::new(TriggerList::default()),
            on_stop: RefCell::new(TriggerList::default()),
            body: RefCell::new(None),
            waker: RefCell::new(None),
        }
    }

    pub(crate) fn prepare(
        &self,
        id: FiberId,
        name: &str,
        joinable: bool,
        custom_arena: bool,
        body: FiberBody,
        waker: Waker,
    ) {
        self.id.set(id);
        *self.name.borrow_mut() = bounded_name(name);
        let mut flags = FiberFlags::CANCELLABLE;
        if joinable {
            flags |= FiberFlags::JOINABLE;
        }
        if custom_arena {
            flags |= FiberFlags::CUSTOM_ARENA;
        }
        self.flags.set(flags);
        *self.diag.borrow_mut() = None;
        self.csw.set(0);
        self.waiters.borrow_mut().clear();
        self.on_yield.borrow_mut().clear();
        self.on_stop.borrow_mut().clear();
        *self.body.borrow_mut() = Some(body);
        *self.waker.borrow_mut() = Some(waker);
    }

    /// Strip identity before parking in the dead pool.
    pub(crate) fn reset_for_pool(&self) {
        self.flags.set(FiberFlags::empty());
        self.name.borrow_mut().clear();
        *self.diag.borrow_mut() = None;
        self.waiters.borrow_mut().clear();
        self.on_yield.borrow_mut().clear();
        self.on_stop.borrow_mut().clear();
        *self.body.borrow_mut() = None;
        *self.waker.borrow_mut() = None;
        self.arena.borrow_mut().recycle();
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id.get()
    }

    pub(crate) fn flags(&self) -> FiberFlags {
        self.flags.get()
    }

    pub(crate) fn add_flags(&self, add: FiberFlags) {
        self.flags.set(self.flags.get() | add);
    }

    pub(crate) fn remove_flags(&self, remove: FiberFlags) {
        self.flags.set(self.flags.get() - remove);
    }

    pub(crate) fn set_diag(&self, e: Option<Error>) {
        *self.diag.borrow_mut() = e;
    }

    pub(crate) fn take_diag(&self) -> Option<Error> {
        self.diag.borrow_mut().take()
    }

    pub(crate) fn push_waiter(&self, id: FiberId) {
        let mut waiters = self.waiters.borrow_mut();
        if !waiters.contains(&id) {
            waiters.push(id);
        }
    }

    pub(crate) fn drain_waiters(&self) -> Vec<FiberId> {
        self.waiters.borrow_mut().split_off(0)
    }

    /// Resume the body once. `Pending` leaves the body in place; `Ready`
    /// consumes it.
    pub(crate) fn poll_body(&self) -> Poll<Result<()>> {
        self.csw.set(self.csw.get() + 1);
        let Some(mut body) = self.body.borrow_mut().take() else {
            return Poll::Ready(Ok(()));
        };
        let waker = self
            .waker
            .borrow()
            .clone()
            .expect("fiber resumed without a waker");
        let mut cx = Context::from_waker(&waker);
        match body.as_mut().poll(&mut cx) {
            Poll::Pending => {
                *self.body.borrow_mut() = Some(body);
                Poll::Pending
            }
            Poll::Ready(res) => Poll::Ready(res),
        }
    }
}

fn bounded_name(name: &str) -> String {
    if name.len() <= FIBER_NAME_MAX {
        return name.to_string();
    }
    let mut end = FIBER_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Configures and spawns a fiber on the current cord.
#[derive(Debug)]
pub struct Builder {
    name: String,
    capacity: Option<usize>,
    joinable: bool,
}

// === impl Builder ===

impl Builder {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            capacity: None,
            joinable: false,
        }
    }

    /// Human-readable name, truncated to [`FIBER_NAME_MAX`] bytes.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Arena capacity in bytes (the stack-size analogue). Fibers with a
    /// custom capacity are not recycled through the dead pool.
    pub fn arena_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// A joinable fiber is held after death until some fiber consumes its
    /// result with [`FiberHandle::join`].
    pub fn joinable(mut self, joinable: bool) -> Self {
        self.joinable = joinable;
        self
    }

    /// Create the fiber and append it to the tail of the ready queue.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OutOfMemory`] when the fiber cannot be allocated.
    ///
    /// # Panics
    ///
    /// Panics when called outside a cord.
    pub fn spawn<F>(self, body: F) -> Result<FiberHandle>
    where
        F: Future<Output = Result<()>> + 'static,
    {
        with_current(|cord| cord.spawn(&self.name, self.capacity, self.joinable, Box::pin(body)))
            .map(|f| FiberHandle { f })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a spawned fiber.
#[derive(Clone)]
pub struct FiberHandle {
    pub(crate) f: Rc<Fiber>,
}

// === impl FiberHandle ===

impl FiberHandle {
    pub fn id(&self) -> FiberId {
        self.f.id()
    }

    pub fn name(&self) -> String {
        self.f.name.borrow().clone()
    }

    pub fn is_dead(&self) -> bool {
        self.f.flags().contains(FiberFlags::DEAD)
    }

    pub fn is_cancelled(&self) -> bool {
        self.f.flags().contains(FiberFlags::CANCELLED)
    }

    /// Move the fiber to the tail of the ready queue; no-op when it is
    /// already READY or DEAD.
    pub fn wakeup(&self) {
        with_current(|cord| cord.wakeup(&self.f));
    }

    /// Set CANCELLED and wake the fiber when it is cancellable. The fiber
    /// observes the cancellation at its next suspension point.
    pub fn cancel(&self) {
        with_current(|cord| cord.cancel_fiber(&self.f));
    }

    pub fn set_joinable(&self, joinable: bool) {
        if joinable {
            self.f.add_flags(FiberFlags::JOINABLE);
        } else {
            self.f.remove_flags(FiberFlags::JOINABLE);
        }
    }

    /// Wait until the fiber is dead and take over its diagnostic: a fiber
    /// that failed hands its error to the joiner. The target is recycled.
    ///
    /// The wait itself tolerates spurious wakeups and keeps waiting when the
    /// joiner is cancelled; only the target's state ends it.
    pub fn join(&self) -> Join {
        Join {
            target: self.f.clone(),
        }
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.f.id())
            .field("name", &*self.f.name.borrow())
            .field("flags", &self.f.flags())
            .finish()
    }
}

/// Future returned by [`FiberHandle::join`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Join {
    target: Rc<Fiber>,
}

impl Future for Join {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        with_current(|cord| {
            let me = cord.current_id();
            if self.target.id() == me {
                return Poll::Ready(Err(fail(Error::IllegalParams(
                    "a fiber cannot join itself".into(),
                ))));
            }
            if !self.target.flags().contains(FiberFlags::JOINABLE) {
                return Poll::Ready(Err(fail(Error::IllegalParams(
                    "the fiber is not joinable".into(),
                ))));
            }
            if self.target.flags().contains(FiberFlags::DEAD) {
                let err = self.target.take_diag();
                cord.reclaim(&self.target);
                cord.current_fiber().set_diag(err.clone());
                return match err {
                    Some(e) => Poll::Ready(Err(e)),
                    None => Poll::Ready(Ok(())),
                };
            }
            self.target.push_waiter(me);
            Poll::Pending
        })
    }
}

/// Record `e` in the current fiber's diagnostic slot and hand it back.
fn fail(e: Error) -> Error {
    with_current(|cord| cord.current_fiber().set_diag(Some(e.clone())));
    e
}

/// Cancellation check shared by every suspension point.
pub(crate) fn observed_cancel() -> Result<()> {
    with_current(|cord| {
        let f = cord.current_fiber();
        let flags = f.flags();
        if flags.contains(FiberFlags::CANCELLED) && flags.contains(FiberFlags::CANCELLABLE) {
            f.set_diag(Some(Error::FiberIsCancelled));
            Err(Error::FiberIsCancelled)
        } else {
            Ok(())
        }
    })
}

/// Spawn a fiber at the tail of the ready queue.
///
/// # Errors
///
/// Fails with [`Error::OutOfMemory`] when the fiber cannot be allocated.
///
/// # Panics
///
/// Panics when called outside a cord.
pub fn spawn<F>(name: &str, body: F) -> Result<FiberHandle>
where
    F: Future<Output = Result<()>> + 'static,
{
    Builder::new().name(name).spawn(body)
}

/// Spawn a fiber and reschedule the caller behind it, so the new fiber runs
/// before the caller continues. Cancellation of the caller stays pending
/// until its next suspension point.
///
/// # Errors
///
/// Fails with [`Error::OutOfMemory`] when the fiber cannot be allocated.
pub async fn start<F>(name: &str, body: F) -> Result<FiberHandle>
where
    F: Future<Output = Result<()>> + 'static,
{
    let handle = spawn(name, body)?;
    let _ = yield_now().await;
    Ok(handle)
}

/// Park the current fiber until an explicit [`wakeup`] (the classic yield).
///
/// # Errors
///
/// Fails with [`Error::FiberIsCancelled`] when cancellation is observed on
/// resume.
pub fn suspend() -> Suspend {
    Suspend { suspended: false }
}

#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
#[derive(Debug)]
pub struct Suspend {
    suspended: bool,
}

impl Future for Suspend {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.suspended {
            this.suspended = true;
            return Poll::Pending;
        }
        Poll::Ready(observed_cancel())
    }
}

/// Wake up self, then yield: every other ready fiber runs before this one
/// resumes.
///
/// # Errors
///
/// Fails with [`Error::FiberIsCancelled`] when cancellation is observed on
/// resume.
pub fn yield_now() -> YieldNow {
    YieldNow { suspended: false }
}

#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
#[derive(Debug)]
pub struct YieldNow {
    suspended: bool,
}

impl Future for YieldNow {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.suspended {
            this.suspended = true;
            with_current(|cord| cord.wakeup_current());
            return Poll::Pending;
        }
        Poll::Ready(observed_cancel())
    }
}

/// Sleep for `duration`. A zero duration forces one event-loop iteration
/// (yield to every ready fiber, then resume). An explicit [`wakeup`] ends
/// the sleep early.
///
/// # Errors
///
/// Fails with [`Error::FiberIsCancelled`] when cancellation is observed on
/// resume.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        state: SleepState::Init,
    }
}

#[derive(Debug, Clone, Copy)]
enum SleepState {
    Init,
    Waiting(Option<u64>),
    Done,
}

#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
#[derive(Debug)]
pub struct Sleep {
    duration: Duration,
    state: SleepState,
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.state {
            SleepState::Init => {
                if this.duration.is_zero() {
                    with_current(|cord| cord.wakeup_current());
                    this.state = SleepState::Waiting(None);
                } else {
                    let token = with_current(|cord| {
                        cord.arm_timer(Instant::now() + this.duration, cord.current_id())
                    });
                    this.state = SleepState::Waiting(Some(token));
                }
                Poll::Pending
            }
            SleepState::Waiting(token) => {
                if let Some(token) = token {
                    with_current(|cord| cord.disarm_timer(token));
                }
                this.state = SleepState::Done;
                Poll::Ready(observed_cancel())
            }
            SleepState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let SleepState::Waiting(Some(token)) = self.state {
            try_with_current(|cord| cord.disarm_timer(token));
        }
    }
}

/// Wake a fiber by id; no-op when unknown, READY or DEAD.
///
/// # Panics
///
/// Panics when called outside a cord.
pub fn wakeup(id: FiberId) {
    with_current(|cord| cord.wakeup_id(id));
}

/// Cancel a fiber by id; wakes it when it is cancellable.
///
/// # Panics
///
/// Panics when called outside a cord.
pub fn cancel(id: FiberId) {
    with_current(|cord| {
        if let Some(f) = cord.lookup(id) {
            cord.cancel_fiber(&f);
        }
    });
}

/// Look up a live fiber by id.
pub fn find(id: FiberId) -> Option<FiberHandle> {
    with_current(|cord| cord.lookup(id)).map(|f| FiberHandle { f })
}

/// Id of the running fiber.
///
/// # Panics
///
/// Panics outside fiber context.
pub fn self_id() -> FiberId {
    with_current(|cord| cord.current_fiber().id())
}

/// Name of the running fiber.
pub fn name() -> String {
    with_current(|cord| cord.current_fiber().name.borrow().clone())
}

pub fn set_name(name: &str) {
    with_current(|cord| {
        *cord.current_fiber().name.borrow_mut() = bounded_name(name);
    });
}

/// Context switches of the running fiber so far.
pub fn csw() -> u64 {
    with_current(|cord| cord.current_fiber().csw.get())
}

pub fn is_cancelled() -> bool {
    with_current(|cord| {
        cord.current_fiber()
            .flags()
            .contains(FiberFlags::CANCELLED)
    })
}

/// Voluntary cancellation point.
///
/// # Errors
///
/// Fails with [`Error::FiberIsCancelled`] when the fiber has been cancelled,
/// regardless of the CANCELLABLE flag.
pub fn test_cancel() -> Result<()> {
    with_current(|cord| {
        let f = cord.current_fiber();
        if f.flags().contains(FiberFlags::CANCELLED) {
            f.set_diag(Some(Error::FiberIsCancelled));
            Err(Error::FiberIsCancelled)
        } else {
            Ok(())
        }
    })
}

/// Toggle the CANCELLABLE flag, returning the previous value. Guards around
/// critical sections must restore the previous value on all exit paths.
pub fn cancellable(cancellable: bool) -> bool {
    with_current(|cord| {
        let f = cord.current_fiber();
        let prev = f.flags().contains(FiberFlags::CANCELLABLE);
        if cancellable {
            f.add_flags(FiberFlags::CANCELLABLE);
        } else {
            f.remove_flags(FiberFlags::CANCELLABLE);
        }
        prev
    })
}

/// Last error recorded in the current fiber's diagnostic slot.
pub fn last_error() -> Option<Error> {
    with_current(|cord| cord.current_fiber().diag.borrow().clone())
}

pub fn clear_error() {
    with_current(|cord| cord.current_fiber().set_diag(None));
}

/// Borrow the current fiber's arena. Do not suspend and do not reset the
/// arena inside the closure; outputs live until [`arena_reset`] or recycle.
pub fn with_arena<R>(f: impl FnOnce(&Arena) -> R) -> R {
    with_current(|cord| {
        let fiber = cord.current_fiber();
        let arena = fiber.arena.borrow();
        f(&arena)
    })
}

/// Drop every arena allocation of the current fiber.
pub fn arena_reset() {
    with_current(|cord| cord.current_fiber().arena.borrow_mut().reset());
}

/// Register a callback to run after every suspension of the current fiber,
/// in registration order. Failures are logged and dropped.
pub fn on_yield(f: impl FnMut() -> Result<()> + 'static) -> TriggerId {
    with_current(|cord| {
        cord.current_fiber()
            .on_yield
            .borrow_mut()
            .add(Box::new(f))
    })
}

/// Register a callback to run exactly once at fiber termination, in reverse
/// registration order.
pub fn on_stop(f: impl FnMut() -> Result<()> + 'static) -> TriggerId {
    with_current(|cord| {
        cord.current_fiber()
            .on_stop
            .borrow_mut()
            .add(Box::new(f))
    })
}

pub fn remove_on_yield(id: TriggerId) -> bool {
    with_current(|cord| cord.current_fiber().on_yield.borrow_mut().remove(id))
}

pub fn remove_on_stop(id: TriggerId) -> bool {
    with_current(|cord| cord.current_fiber().on_stop.borrow_mut().remove(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cord;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn bounded_name_respects_char_boundaries() {
        let long = "ä".repeat(200);
        let bounded = bounded_name(&long);
        assert!(bounded.len() <= FIBER_NAME_MAX);
        assert!(long.starts_with(&bounded));
    }

    #[test]
    fn spawned_fibers_run_in_fifo_order() {
        cord::run("test", async {
            let order = Rc::new(StdRefCell::new(Vec::new()));
            for i in 0..3 {
                let order = order.clone();
                spawn(&format!("f{i}"), async move {
                    order.borrow_mut().push(i);
                    Ok(())
                })
                .unwrap();
            }
            // reschedule behind all three
            yield_now().await.unwrap();
            assert_eq!(*order.borrow(), vec![0, 1, 2]);
        });
    }

    #[test]
    fn start_runs_the_new_fiber_before_the_caller_continues() {
        cord::run("test", async {
            let hit = Rc::new(Cell::new(false));
            let h2 = hit.clone();
            start("eager", async move {
                h2.set(true);
                Ok(())
            })
            .await
            .unwrap();
            assert!(hit.get());
        });
    }

    #[test]
    fn join_transfers_the_diagnostic() {
        cord::run("test", async {
            let h = Builder::new()
                .name("failing")
                .joinable(true)
                .spawn(async { Err(Error::IllegalParams("boom".into())) })
                .unwrap();
            let res = h.join().await;
            assert_eq!(res, Err(Error::IllegalParams("boom".into())));
            assert_eq!(
                last_error(),
                Some(Error::IllegalParams("boom".into()))
            );
        });
    }

    #[test]
    fn join_of_non_joinable_fiber_fails() {
        cord::run("test", async {
            let h = spawn("plain", async { Ok(()) }).unwrap();
            assert!(matches!(h.join().await, Err(Error::IllegalParams(_))));
        });
    }

    #[test]
    fn cancel_is_observed_at_the_next_suspension_point() {
        cord::run("test", async {
            let h = Builder::new()
                .name("victim")
                .joinable(true)
                .spawn(async {
                    sleep(Duration::from_secs(10)).await?;
                    Ok(())
                })
                .unwrap();
            yield_now().await.unwrap(); // let the victim park on its timer
            h.cancel();
            assert_eq!(h.join().await, Err(Error::FiberIsCancelled));
        });
    }

    #[test]
    fn non_cancellable_sections_defer_observation() {
        cord::run("test", async {
            let slept = Rc::new(Cell::new(false));
            let s2 = slept.clone();
            let h = Builder::new()
                .name("guarded")
                .joinable(true)
                .spawn(async move {
                    let prev = cancellable(false);
                    sleep(Duration::from_millis(20)).await?;
                    s2.set(true);
                    cancellable(prev);
                    test_cancel()?;
                    Ok(())
                })
                .unwrap();
            yield_now().await.unwrap();
            h.cancel();
            assert_eq!(h.join().await, Err(Error::FiberIsCancelled));
            assert!(slept.get(), "the guarded sleep was interrupted");
        });
    }

    #[test]
    fn wakeup_while_ready_does_not_enqueue_twice() {
        cord::run("test", async {
            let runs = Rc::new(Cell::new(0));
            let r2 = runs.clone();
            let h = spawn("counter", async move {
                loop {
                    r2.set(r2.get() + 1);
                    suspend().await?;
                }
            })
            .unwrap();
            yield_now().await.unwrap(); // first run
            h.wakeup();
            h.wakeup();
            h.wakeup();
            yield_now().await.unwrap();
            assert_eq!(runs.get(), 2);
            h.cancel();
            let _ = yield_now().await;
        });
    }

    #[test]
    fn sleep_zero_forces_one_loop_iteration() {
        cord::run("test", async {
            let other_ran = Rc::new(Cell::new(false));
            let o2 = other_ran.clone();
            spawn("other", async move {
                o2.set(true);
                Ok(())
            })
            .unwrap();
            sleep(Duration::ZERO).await.unwrap();
            assert!(other_ran.get());
        });
    }

    #[test]
    fn sleep_waits_roughly_the_requested_time() {
        cord::run("test", async {
            let begin = Instant::now();
            sleep(Duration::from_millis(30)).await.unwrap();
            assert!(begin.elapsed() >= Duration::from_millis(25));
        });
    }

    #[test]
    fn explicit_wakeup_ends_a_sleep_early() {
        cord::run("test", async {
            let h = Builder::new()
                .name("sleeper")
                .joinable(true)
                .spawn(async {
                    sleep(Duration::from_secs(60)).await?;
                    Ok(())
                })
                .unwrap();
            yield_now().await.unwrap();
            h.wakeup();
            let begin = Instant::now();
            h.join().await.unwrap();
            assert!(begin.elapsed() < Duration::from_secs(10));
        });
    }

    #[test]
    fn triggers_fire_in_documented_order() {
        cord::run("test", async {
            let log = Rc::new(StdRefCell::new(Vec::new()));

            let l2 = log.clone();
            let h = Builder::new()
                .name("traced")
                .joinable(true)
                .spawn(async move {
                    let l3 = l2.clone();
                    on_yield(move || {
                        l3.borrow_mut().push("yield");
                        Ok(())
                    });
                    let l3 = l2.clone();
                    on_stop(move || {
                        l3.borrow_mut().push("stop-a");
                        Ok(())
                    });
                    let l3 = l2.clone();
                    on_stop(move || {
                        l3.borrow_mut().push("stop-b");
                        Ok(())
                    });
                    yield_now().await?;
                    Ok(())
                })
                .unwrap();
            h.join().await.unwrap();
            // on_yield after the explicit yield, on_stop in reverse order
            assert_eq!(*log.borrow(), vec!["yield", "stop-b", "stop-a"]);
        });
    }

    #[test]
    fn a_trigger_may_remove_itself() {
        cord::run("test", async {
            let hits = Rc::new(Cell::new(0));
            let h2 = hits.clone();
            let slot: Rc<Cell<Option<TriggerId>>> = Rc::new(Cell::new(None));
            let s2 = slot.clone();
            let id = on_yield(move || {
                h2.set(h2.get() + 1);
                if let Some(id) = s2.get() {
                    remove_on_yield(id);
                }
                Ok(())
            });
            slot.set(Some(id));
            yield_now().await.unwrap();
            yield_now().await.unwrap();
            assert_eq!(hits.get(), 1);
        });
    }

    #[test]
    fn arena_allocations_live_until_reset() {
        cord::run("test", async {
            let used = with_arena(|arena| {
                arena.alloc_copy(b"transient").unwrap();
                arena.used()
            });
            assert!(used >= 9);
            arena_reset();
            assert_eq!(with_arena(loam_arena::Arena::used), 0);
        });
    }

    #[test]
    fn find_and_identity() {
        cord::run("test", async {
            assert_eq!(self_id(), FiberId(1));
            let h = Builder::new()
                .name("lookup-me")
                .joinable(true)
                .spawn(async {
                    suspend().await?;
                    Ok(())
                })
                .unwrap();
            let found = find(h.id()).unwrap();
            assert_eq!(found.name(), "lookup-me");
            assert!(find(FiberId(9999)).is_none());
            h.wakeup();
            h.join().await.unwrap();
        });
    }
}
