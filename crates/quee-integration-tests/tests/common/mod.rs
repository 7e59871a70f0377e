//! Common test utilities for quee integration tests
//!
//! This module provides:
//! - One-time tracing initialisation honouring `RUST_LOG`
//! - A scripted consumer that fails on demand and records every call
//! - Shared test message types

use async_trait::async_trait;
use quee::{Consumer, FaultMessage, Message, QueueName};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[allow(dead_code)]
pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).expect("valid queue name")
}

// ============================================================================
// Test Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
}

impl OrderPlaced {
    #[allow(dead_code)]
    pub fn new(order_id: &str) -> Self {
        Self {
            order_id: order_id.to_string(),
        }
    }
}

// ============================================================================
// Scripted Consumer
// ============================================================================

/// How a [`ScriptedConsumer`] responds to deliveries
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub enum Script {
    Succeed,
    FailTimes(usize),
    AlwaysFail,
}

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Attempt {
    pub order_id: String,
    pub retry_number: u32,
    pub at: Instant,
}

struct ScriptState {
    script: Script,
    failures: AtomicUsize,
    attempts: Mutex<Vec<Attempt>>,
    faults: Mutex<Vec<FaultMessage<OrderPlaced>>>,
    failing_fault_handler: bool,
}

/// Consumer whose clones share one record of calls
#[derive(Clone)]
pub struct ScriptedConsumer {
    state: Arc<ScriptState>,
}

#[allow(dead_code)]
impl ScriptedConsumer {
    pub fn new(script: Script) -> Self {
        Self::build(script, false)
    }

    /// Consumer whose fault handler itself fails
    pub fn with_failing_fault_handler(script: Script) -> Self {
        Self::build(script, true)
    }

    fn build(script: Script, failing_fault_handler: bool) -> Self {
        Self {
            state: Arc::new(ScriptState {
                script,
                failures: AtomicUsize::new(0),
                attempts: Mutex::new(Vec::new()),
                faults: Mutex::new(Vec::new()),
                failing_fault_handler,
            }),
        }
    }

    /// Factory handing out clones that report into this consumer
    pub fn factory(&self) -> impl Fn() -> ScriptedConsumer + Send + Sync + 'static {
        let consumer = self.clone();
        move || consumer.clone()
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.state.attempts.lock().unwrap().clone()
    }

    pub fn faults(&self) -> Vec<FaultMessage<OrderPlaced>> {
        self.state.faults.lock().unwrap().clone()
    }

    /// Order ids in the order they were first attempted
    pub fn dispatch_order(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for attempt in self.attempts() {
            if !seen.contains(&attempt.order_id) {
                seen.push(attempt.order_id);
            }
        }
        seen
    }
}

#[async_trait]
impl Consumer<OrderPlaced> for ScriptedConsumer {
    async fn consume(&self, message: Message<OrderPlaced>) -> anyhow::Result<()> {
        self.state.attempts.lock().unwrap().push(Attempt {
            order_id: message.payload.order_id.clone(),
            retry_number: message.retry_number,
            at: Instant::now(),
        });

        let fail = match self.state.script {
            Script::Succeed => false,
            Script::AlwaysFail => true,
            Script::FailTimes(times) => self.state.failures.fetch_add(1, Ordering::SeqCst) < times,
        };

        if fail {
            anyhow::bail!("order {} could not be processed", message.payload.order_id);
        }
        Ok(())
    }

    async fn consume_fault(&self, message: FaultMessage<OrderPlaced>) -> anyhow::Result<()> {
        self.state.faults.lock().unwrap().push(message);
        if self.state.failing_fault_handler {
            anyhow::bail!("fault handler unavailable");
        }
        Ok(())
    }
}
