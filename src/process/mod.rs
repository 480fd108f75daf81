//! Supervision of engine child processes.

mod output;
mod supervisor;

pub use output::{LineStream, OutputCapture};
pub use supervisor::{terminate_pid_blocking, ProcessHandle, ProcessSpec};
