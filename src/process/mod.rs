//! Generic step-execution state machine with rollback

pub mod engine;
pub mod latch;
pub mod step;

pub use engine::{LoggingListener, Process, ProcessHandle, ProcessListener, ProcessState};
pub use latch::{CompletionLatch, LatchClaim, LatchWaiter, WaitOutcome};
pub use step::{ProcessStep, StepContext};
