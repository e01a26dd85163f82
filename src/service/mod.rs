//! Tor process service layer
//!
//! Everything needed to run one Tor instance: process execution, bootstrap
//! detection, the control port, the SOCKS probe and port allocation.

pub mod allocator;
pub mod control;
pub mod executor;
pub mod probe;
pub mod scanner;
pub mod signal;
pub mod supervisor;

pub use allocator::{PortAllocator, PortPair, RandomPortAllocator, SequencePortAllocator};
pub use control::ControlReply;
pub use executor::{
    ExecuteRequest, ExecutionResult, LineCallback, ProcessExecutor, TokioProcessExecutor,
};
pub use signal::{AsyncSignal, SignalWait};
pub use supervisor::{ProcessSupervisor, StartOutcome};
