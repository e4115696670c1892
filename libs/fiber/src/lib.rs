// Copyright 2026 Loam Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative fiber runtime.
//!
//! Many fibers are multiplexed over one OS thread (a *cord*) driven by a
//! non-blocking event loop: a FIFO ready queue, a one-shot timer heap, and a
//! cross-thread injector for wakeups posted from other cords. Scheduling is
//! strictly cooperative: a fiber runs until it suspends at one of the defined
//! suspension points, and is resumed only when something puts it back on the
//! ready queue.
//!
//! ```
//! use std::time::Duration;
//! use loam_fiber::{cord, fiber};
//!
//! let sum = cord::run("example", async {
//!     let h = fiber::Builder::new()
//!         .name("adder")
//!         .joinable(true)
//!         .spawn(async {
//!             fiber::sleep(Duration::from_millis(1)).await?;
//!             Ok(())
//!         })
//!         .unwrap();
//!     h.join().await.unwrap();
//!     2 + 2
//! });
//! assert_eq!(sum, 4);
//! ```
//!
//! Every failure surfaces through the current fiber's diagnostic slot as a
//! [`loam_error::Error`]; joining a failed fiber moves the error into the
//! joiner.

mod cond;
pub mod cord;
pub mod fiber;
mod trigger;

pub use loam_error::{Error, Result};
