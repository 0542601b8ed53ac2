//! Exit code logic for the stacks process.
//!
//! Single responsibility: map a finished run to the process exit outcome.

use std::process::ExitCode;

use stacks_core::RunStats;

/// Process outcome; only a run where every item completed is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    Success,
    Failure,
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Success => ExitCode::SUCCESS,
            ProcessExit::Failure => ExitCode::FAILURE,
        }
    }
}

/// Failed and interrupted items both make the run a failure.
pub(crate) fn determine_exit_outcome(stats: &RunStats) -> ProcessExit {
    if stats.all_completed() {
        ProcessExit::Success
    } else {
        ProcessExit::Failure
    }
}
