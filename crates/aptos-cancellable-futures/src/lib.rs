// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Futures paired with a composable, best-effort cancellation hook.
//!
//! A [`CancellableFuture`] is a cloneable (shared) future plus a
//! [`CancellationHandler`]. Handlers compose: zipping two futures produces a
//! handler that stops both sides in parallel, and a handler can be deferred
//! until an asynchronous decision determines which work actually runs.
//! Stopping is cooperative — a handler resolves once best-effort signalling
//! has been attempted, whether or not the underlying work honors it.

mod future;
mod handler;
mod semaphore;

pub use future::{Aborted, CancellableFuture, FuturePromise};
pub use handler::CancellationHandler;
pub use semaphore::{AsyncSemaphore, Permit, PermitSlot};
