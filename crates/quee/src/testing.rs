//! Shared mocks for unit tests.

use crate::consumer::Consumer;
use crate::message::{FaultMessage, Message, Payload};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Consumer that records every call and fails on demand.
///
/// Clones share state, so a factory returning `probe.clone()` yields fresh
/// instances that all report into the same probe.
pub(crate) struct ConsumerProbe<T> {
    state: Arc<ProbeState<T>>,
}

struct ProbeState<T> {
    failures_remaining: AtomicUsize,
    panics_remaining: AtomicUsize,
    fault_handler_fails: AtomicBool,
    fault_handler_panics: AtomicBool,
    attempts: AtomicUsize,
    consumed: Mutex<Vec<Message<T>>>,
    faults: Mutex<Vec<FaultMessage<T>>>,
}

impl<T> Clone for ConsumerProbe<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> ConsumerProbe<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(ProbeState {
                failures_remaining: AtomicUsize::new(0),
                panics_remaining: AtomicUsize::new(0),
                fault_handler_fails: AtomicBool::new(false),
                fault_handler_panics: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
                consumed: Mutex::new(Vec::new()),
                faults: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fail the next `count` calls to `consume`
    pub(crate) fn fail_first(self, count: usize) -> Self {
        self.state.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn always_fail(self) -> Self {
        self.fail_first(usize::MAX)
    }

    /// Panic in the next `count` calls to `consume`
    pub(crate) fn panic_first(self, count: usize) -> Self {
        self.state.panics_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn always_panic(self) -> Self {
        self.panic_first(usize::MAX)
    }

    pub(crate) fn panicking_fault_handler(self) -> Self {
        self.state.fault_handler_panics.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_fault_handler(self) -> Self {
        self.state.fault_handler_fails.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn consumed(&self) -> Vec<Message<T>>
    where
        T: Clone,
    {
        self.state.consumed.lock().unwrap().clone()
    }

    pub(crate) fn faults(&self) -> Vec<FaultMessage<T>>
    where
        T: Clone,
    {
        self.state.faults.lock().unwrap().clone()
    }
}

#[async_trait]
impl<T: Payload> Consumer<T> for ConsumerProbe<T> {
    async fn consume(&self, message: Message<T>) -> anyhow::Result<()> {
        let attempt = self.state.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let should_panic = self
            .state
            .panics_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_panic {
            panic!("attempt {attempt} panicked");
        }

        let should_fail = self
            .state
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("attempt {attempt} failed");
        }

        self.state.consumed.lock().unwrap().push(message);
        Ok(())
    }

    async fn consume_fault(&self, message: FaultMessage<T>) -> anyhow::Result<()> {
        self.state.faults.lock().unwrap().push(message);
        if self.state.fault_handler_panics.load(Ordering::SeqCst) {
            panic!("fault handler panicked");
        }
        if self.state.fault_handler_fails.load(Ordering::SeqCst) {
            anyhow::bail!("fault handler failed");
        }
        Ok(())
    }
}
