use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

/// A single terminal status line naming the packages this process is waiting
/// on (locked by other processes). Disabled in non-interactive use, where it
/// degrades to nothing and the log events carry the same information.
#[derive(Debug)]
pub struct TermStatusLine {
    bar: Option<ProgressBar>,
    waiting: Vec<String>,
}

impl TermStatusLine {
    pub fn new(enabled: bool) -> Self {
        let bar = enabled.then(|| {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
        Self {
            bar,
            waiting: Vec::new(),
        }
    }

    /// Add a package to the waiting line.
    pub fn add(&mut self, pkg_id: &str) {
        if self.waiting.iter().any(|id| id == pkg_id) {
            return;
        }
        self.waiting.push(pkg_id.to_string());
        if let Some(bar) = &self.bar {
            bar.set_message(format!("Waiting for {}", self.waiting.join(", ")));
        }
    }

    /// Erase the line and forget the waiting set.
    pub fn clear(&mut self) {
        self.waiting.clear();
        if let Some(bar) = &self.bar {
            bar.set_message(String::new());
            bar.finish_and_clear();
        }
    }

    pub fn waiting(&self) -> &[String] {
        &self.waiting
    }
}

/// `[n/total]` progress accounting across one installer run.
#[derive(Debug)]
pub struct InstallStatusTracker {
    current: usize,
    total: usize,
    term: TermStatusLine,
}

impl InstallStatusTracker {
    pub fn new(total: usize, interactive: bool) -> Self {
        Self {
            current: 0,
            total,
            term: TermStatusLine::new(interactive),
        }
    }

    pub fn set_total(&mut self, total: usize) {
        self.total = total;
    }

    pub fn progress(&self) -> String {
        format!("[{}/{}]", self.current, self.total)
    }

    pub fn installing(&mut self, pkg_id: &str) {
        self.current = (self.current + 1).min(self.total.max(1));
        info!("Installing {} {}", pkg_id, self.progress());
    }

    pub fn installed(&mut self, pkg_id: &str) {
        info!("[+] {}", pkg_id);
    }

    pub fn waiting_for(&mut self, pkg_id: &str) {
        self.term.add(pkg_id);
    }

    pub fn done(&mut self) {
        self.term.clear();
    }

    pub fn term(&self) -> &TermStatusLine {
        &self.term
    }
}
