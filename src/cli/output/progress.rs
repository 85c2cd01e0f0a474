//! Progress reporting for evaluation runs using indicatif.

use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

use crate::domain::errors::DomainError;
use crate::domain::models::TestUnit;
use crate::services::task_queue::{QueueObserver, QueuedTask};

const PROGRESS_TEMPLATE: &str =
    "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg} (ETA: {eta})";
const PROGRESS_CHARS: &str = "█▓▒░ ";

/// Create a progress bar with ETA calculation.
pub fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(PROGRESS_CHARS);
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Drives a progress bar from task queue callbacks.
pub struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    pub fn new() -> Self {
        Self {
            bar: create_progress_bar(0),
        }
    }

    /// An observer that draws nothing (JSON mode, tests).
    pub fn hidden() -> Self {
        let bar = ProgressBar::hidden();
        bar.set_draw_target(ProgressDrawTarget::hidden());
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn length(&self) -> Option<u64> {
        self.bar.length()
    }
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueObserver<TestUnit> for ProgressObserver {
    fn on_task_start(&self, task: &QueuedTask) {
        self.bar.set_message(task.name.clone());
    }

    fn on_task_complete(&self, task: &QueuedTask, result: &TestUnit, _duration: Duration) {
        let mark = if result.passed() {
            style("✓").green()
        } else {
            style("✗").yellow()
        };
        self.bar.set_message(format!("{mark} {}", task.id));
    }

    fn on_task_error(&self, task: &QueuedTask, _error: &DomainError, _duration: Duration) {
        self.bar
            .set_message(format!("{} {}", style("!").red(), task.id));
    }

    fn on_progress(&self, completed: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(completed as u64);
    }
}
