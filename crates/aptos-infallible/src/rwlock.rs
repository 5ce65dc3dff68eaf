// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use std::sync::{RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard};

/// A simple wrapper around the read() and write() functions of a
/// std::sync::RwLock, hiding the poisoning Result.
#[derive(Debug, Default)]
pub struct RwLock<T>(StdRwLock<T>);

impl<T> RwLock<T> {
    pub fn new(t: T) -> Self {
        Self(StdRwLock::new(t))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0
            .read()
            .expect("Cannot currently handle a poisoned lock")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0
            .write()
            .expect("Cannot currently handle a poisoned lock")
    }

    pub fn into_inner(self) -> T {
        self.0
            .into_inner()
            .expect("Cannot currently handle a poisoned lock")
    }
}
