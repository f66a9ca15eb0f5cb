//! Console rendering of engine progress events.
//!
//! The total is unknown up front (pages stream in while transfers run), so
//! this is a spinner with a completion counter rather than a bounded bar.
//! Hidden when stdout is not a TTY so piped output and service logs stay
//! clean.

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::engine::events::{ProgressSink, SyncEvent};

pub struct ConsoleProgress {
    bar: ProgressBar,
}

impl ConsoleProgress {
    pub fn new(disabled: bool) -> Self {
        let bar = if disabled || !std::io::stdout().is_terminal() {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{elapsed_precise}] {pos} done {msg}")
                    .expect("valid template"),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        };
        Self { bar }
    }
}

impl ProgressSink for ConsoleProgress {
    fn emit(&self, event: &SyncEvent) {
        match event {
            SyncEvent::EntryStarted { path, .. } => {
                self.bar.set_message(path.clone());
            }
            SyncEvent::EntryCompleted { .. } => {
                self.bar.inc(1);
            }
            SyncEvent::EntryFailed { path, error } => {
                // suspend coordinates the redraw so the log line and the
                // spinner don't garble each other.
                self.bar
                    .suspend(|| tracing::error!("failed: {}: {}", path, error));
                self.bar.inc(1);
            }
            SyncEvent::RunFinished(_) => {
                self.bar.finish_and_clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reconcile::WorkKind;

    #[test]
    fn disabled_progress_is_hidden() {
        let progress = ConsoleProgress::new(true);
        assert!(progress.bar.is_hidden());
    }

    #[test]
    fn events_drive_the_counter() {
        let progress = ConsoleProgress::new(true);
        progress.emit(&SyncEvent::EntryStarted {
            path: "a.txt".into(),
            kind: WorkKind::Fetch,
        });
        progress.emit(&SyncEvent::EntryCompleted {
            path: "a.txt".into(),
            kind: WorkKind::Fetch,
            bytes: 10,
        });
        progress.emit(&SyncEvent::EntryFailed {
            path: "b.txt".into(),
            error: "boom".into(),
        });
        assert_eq!(progress.bar.position(), 2);
    }
}
