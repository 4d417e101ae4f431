//! Memory reporting.

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

/// Snapshot of the ledger counters, emitted at shutdown when the host is
/// configured to dump memory usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryReport {
    /// Bytes accounted live at snapshot time
    pub live_bytes: usize,
    /// Allocations accounted live at snapshot time
    pub live_objects: usize,
    /// High-water mark of live bytes
    pub peak_bytes: usize,
    /// Configured ceiling, if one was set
    pub ceiling: Option<usize>,
    /// Process resident set size, if it could be read
    pub process_rss: Option<usize>,
}

impl MemoryReport {
    /// Format as a human-readable summary line.
    pub fn format(&self) -> String {
        let mut line = format!(
            "live {} across {} objects, peak {}",
            format_bytes(self.live_bytes),
            self.live_objects,
            format_bytes(self.peak_bytes),
        );
        if let Some(ceiling) = self.ceiling {
            line.push_str(&format!(", ceiling {}", format_bytes(ceiling)));
        }
        if let Some(rss) = self.process_rss {
            line.push_str(&format!(", rss {}", format_bytes(rss)));
        }
        line
    }
}

/// Format memory size for display.
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Read this process's resident set size.
pub fn process_rss() -> Option<usize> {
    let mut system = System::new_with_specifics(RefreshKind::everything());

    let pid = Pid::from_u32(std::process::id());
    system.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::everything(),
    );

    system.process(pid).map(|p| p.memory() as usize)
}
