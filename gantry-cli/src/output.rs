// Terminal Output
// Colored status lines for the run, validate and plan commands

use workflow_engine::{ExecutionState, StepStatus};

/// Print a right-aligned action followed by a message
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// A passed validation check
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

/// Color a line by the state of the instance it describes
pub fn instance_line(state: ExecutionState, message: &str) {
    let color = match state {
        ExecutionState::Succeeded => "32",
        ExecutionState::Failed => "31",
        ExecutionState::Skipped | ExecutionState::Cancelled => "33",
        ExecutionState::Running => "36",
        ExecutionState::Pending | ExecutionState::Blocked | ExecutionState::Ready => "2",
    };
    eprintln!("\x1b[{}m{}\x1b[0m", color, message);
}

/// Color a line by the status of the step it describes
pub fn step_line(status: StepStatus, message: &str) {
    let color = match status {
        StepStatus::Succeeded => "32",
        StepStatus::Failed => "31",
        StepStatus::Cancelled => "2",
    };
    eprintln!("\x1b[{}m{}\x1b[0m", color, message);
}

/// Header of one dependency layer in a plan
pub fn layer_header(index: usize, total_instances: usize) {
    eprintln!("\x1b[1;34m  Layer {}\x1b[0m ({} instances)", index, total_instances);
}

/// Indented stdout line of a running step
pub fn step_output(line: &str) {
    println!("        | {}", line);
}

/// Indented stderr line of a running step
pub fn step_error(line: &str) {
    eprintln!("\x1b[31m        | {}\x1b[0m", line);
}

pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}
