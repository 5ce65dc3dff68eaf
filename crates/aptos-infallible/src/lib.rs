// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Lock wrappers that treat poisoning as a fatal logic error.
//!
//! A poisoned lock means a thread panicked while holding the guard; none of
//! the call sites in this workspace can recover meaningfully from that, so
//! the wrappers crash instead of forcing `Result` handling onto every caller.

mod mutex;
mod rwlock;

pub use mutex::Mutex;
pub use rwlock::RwLock;
