//! Command execution: the runner, its executor contract and stdio tracking.

mod executor;
mod runner;
mod stdio;

pub use executor::{CommandExecutor, ExecCommandRequest, ExecOutcome, OutputSink, ProcessExecutor};
pub use runner::{
    ExecConfig, ExecEventListener, ExecRequest, ExecRunResult, ExecRunner, ListenerId,
};
pub use stdio::{SequencedChunk, StdioTracker, DEFAULT_MAX_BUFFER_BYTES};
