// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber condition variable.
//!
//! Waiters queue in FIFO order; [`Cond::signal`] releases the head,
//! [`Cond::broadcast`] releases everyone. A timed wait installs a one-shot
//! timer; when a signal lands before the timer fires the wait succeeds and
//! the timer is stopped, otherwise the wait fails with
//! [`Error::TimedOut`]. Purely thread-local, like everything else a fiber
//! touches.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use loam_error::{Error, Result};

use crate::cord::{try_with_current, with_current};
use crate::fiber::{observed_cancel, FiberFlags, FiberId};

#[derive(Default)]
pub struct Cond {
    waiters: RefCell<VecDeque<(FiberId, Rc<Cell<bool>>)>>,
}

// === impl Cond ===

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the longest-waiting fiber, if any.
    pub fn signal(&self) {
        if let Some((id, flag)) = self.waiters.borrow_mut().pop_front() {
            flag.set(true);
            with_current(|cord| cord.wakeup_id(id));
        }
    }

    /// Wake every waiting fiber.
    pub fn broadcast(&self) {
        let drained: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        with_current(|cord| {
            for (id, flag) in drained {
                flag.set(true);
                cord.wakeup_id(id);
            }
        });
    }

    /// Wait until signalled.
    ///
    /// # Errors
    ///
    /// The returned future fails with [`Error::FiberIsCancelled`] when
    /// cancellation is observed while waiting.
    pub fn wait(&self) -> CondWait<'_> {
        CondWait {
            cond: self,
            timeout: None,
            state: WaitState::Init,
        }
    }

    /// Wait until signalled or until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// The returned future fails with [`Error::TimedOut`] when the timer
    /// fires first, or [`Error::FiberIsCancelled`] on observed cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> CondWait<'_> {
        CondWait {
            cond: self,
            timeout: Some(timeout),
            state: WaitState::Init,
        }
    }

    fn forget(&self, flag: &Rc<Cell<bool>>) {
        self.waiters
            .borrow_mut()
            .retain(|(_, f)| !Rc::ptr_eq(f, flag));
    }
}

enum WaitState {
    Init,
    Waiting {
        flag: Rc<Cell<bool>>,
        timer: Option<u64>,
    },
    Done,
}

/// Future returned by [`Cond::wait`] and [`Cond::wait_timeout`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct CondWait<'a> {
    cond: &'a Cond,
    timeout: Option<Duration>,
    state: WaitState,
}

impl Future for CondWait<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.state {
            WaitState::Init => {
                let flag = Rc::new(Cell::new(false));
                let me = with_current(|cord| cord.current_id());
                this.cond.waiters.borrow_mut().push_back((me, flag.clone()));
                let timer = this
                    .timeout
                    .map(|d| with_current(|cord| cord.arm_timer(Instant::now() + d, me)));
                this.state = WaitState::Waiting { flag, timer };
                Poll::Pending
            }
            WaitState::Waiting { flag, timer } => {
                if flag.get() {
                    // signalled; a pending timer is stopped
                    if let Some(token) = timer {
                        with_current(|cord| cord.disarm_timer(*token));
                    }
                    this.state = WaitState::Done;
                    return Poll::Ready(observed_cancel());
                }

                let cancelled = with_current(|cord| {
                    let f = cord.current_fiber();
                    f.flags().contains(FiberFlags::CANCELLED)
                        && f.flags().contains(FiberFlags::CANCELLABLE)
                });
                if cancelled {
                    this.cond.forget(flag);
                    if let Some(token) = timer {
                        with_current(|cord| cord.disarm_timer(*token));
                    }
                    this.state = WaitState::Done;
                    return Poll::Ready(observed_cancel());
                }

                if let Some(token) = timer {
                    let armed = with_current(|cord| cord.timer_is_armed(*token));
                    if !armed {
                        // the timer fired before any signal
                        this.cond.forget(flag);
                        this.state = WaitState::Done;
                        with_current(|cord| {
                            cord.current_fiber().set_diag(Some(Error::TimedOut));
                        });
                        return Poll::Ready(Err(Error::TimedOut));
                    }
                }

                // spurious wakeup: stay queued
                Poll::Pending
            }
            WaitState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for CondWait<'_> {
    fn drop(&mut self) {
        if let WaitState::Waiting { flag, timer } = &self.state {
            self.cond.forget(flag);
            if let Some(token) = timer {
                try_with_current(|cord| cord.disarm_timer(*token));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cord;
    use crate::fiber::{self, Builder};

    #[test]
    fn signal_wakes_the_longest_waiter_first() {
        cord::run("t", async {
            let cond = Rc::new(Cond::new());
            let order = Rc::new(RefCell::new(Vec::new()));

            for i in 0..2 {
                let cond = cond.clone();
                let order = order.clone();
                Builder::new()
                    .name(&format!("w{i}"))
                    .joinable(true)
                    .spawn(async move {
                        cond.wait().await?;
                        order.borrow_mut().push(i);
                        Ok(())
                    })
                    .unwrap();
            }
            fiber::yield_now().await.unwrap(); // both park in the queue

            cond.signal();
            fiber::yield_now().await.unwrap();
            assert_eq!(*order.borrow(), vec![0]);

            cond.signal();
            fiber::yield_now().await.unwrap();
            assert_eq!(*order.borrow(), vec![0, 1]);
        });
    }

    #[test]
    fn broadcast_wakes_everyone() {
        cord::run("t", async {
            let cond = Rc::new(Cond::new());
            let woken = Rc::new(Cell::new(0));
            for i in 0..3 {
                let cond = cond.clone();
                let woken = woken.clone();
                fiber::spawn(&format!("w{i}"), async move {
                    cond.wait().await?;
                    woken.set(woken.get() + 1);
                    Ok(())
                })
                .unwrap();
            }
            fiber::yield_now().await.unwrap();
            cond.broadcast();
            fiber::yield_now().await.unwrap();
            assert_eq!(woken.get(), 3);
        });
    }

    #[test]
    fn wait_timeout_fails_when_no_signal_arrives() {
        cord::run("t", async {
            let cond = Cond::new();
            let begin = Instant::now();
            let res = cond.wait_timeout(Duration::from_millis(20)).await;
            assert_eq!(res, Err(Error::TimedOut));
            assert!(begin.elapsed() >= Duration::from_millis(15));
        });
    }

    #[test]
    fn signal_beats_the_timer() {
        cord::run("t", async {
            let cond = Rc::new(Cond::new());
            let c2 = cond.clone();
            let h = Builder::new()
                .name("waiter")
                .joinable(true)
                .spawn(async move {
                    c2.wait_timeout(Duration::from_secs(60)).await?;
                    Ok(())
                })
                .unwrap();
            fiber::yield_now().await.unwrap();
            cond.signal();
            let begin = Instant::now();
            h.join().await.unwrap();
            assert!(begin.elapsed() < Duration::from_secs(10));
        });
    }

    #[test]
    fn cancellation_is_observed_while_waiting() {
        cord::run("t", async {
            let cond = Rc::new(Cond::new());
            let c2 = cond.clone();
            let h = Builder::new()
                .name("waiter")
                .joinable(true)
                .spawn(async move {
                    c2.wait().await?;
                    Ok(())
                })
                .unwrap();
            fiber::yield_now().await.unwrap();
            h.cancel();
            assert_eq!(h.join().await, Err(Error::FiberIsCancelled));
            assert!(cond.waiters.borrow().is_empty());
        });
    }
}
