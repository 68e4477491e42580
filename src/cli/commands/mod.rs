pub mod backup;
pub mod status;

use std::process::ExitCode;

use crate::backup::RunReport;

pub const EXIT_ABORTED: u8 = 1;
pub const EXIT_LOCKED: u8 = 3;

pub fn exit_code_for(report: &RunReport) -> ExitCode {
    if report.aborted.is_some() {
        ExitCode::from(EXIT_ABORTED)
    } else {
        ExitCode::SUCCESS
    }
}

/// Patterns from the command line win over the configured ones.
pub fn select_patterns<'a>(cli: &'a [String], configured: &'a [String]) -> &'a [String] {
    if cli.is_empty() {
        configured
    } else {
        cli
    }
}
