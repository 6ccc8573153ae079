// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Single-slot timer shared by reconnect backoff and producer idle teardown.

use std::{
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::{runtime::Handle, task::JoinHandle};

/// Holds at most one pending timer. Arming cancels the pending one first.
///
/// Only the wait is cancellable: once the delay elapses the task is spawned on
/// its own, so re-arming never interrupts work already in progress.
pub(crate) struct TimerSlot {
    runtime: Handle,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TimerSlot {
    pub(crate) fn new(runtime: Handle) -> TimerSlot {
        TimerSlot {
            runtime,
            pending: Mutex::new(None),
        }
    }

    pub(crate) fn arm<F>(&self, after: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.abort();
        }

        let runtime = self.runtime.clone();
        *pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            runtime.spawn(task);
        }));
    }

    pub(crate) fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.abort();
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
