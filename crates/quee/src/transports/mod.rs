//! Transport implementations.
//!
//! Remote managed-bus adapters implement [`Transport`](crate::transport::Transport)
//! outside this crate; the loopback transport here runs the same contract
//! in-process.

pub mod loopback;

pub use loopback::LoopbackTransport;
