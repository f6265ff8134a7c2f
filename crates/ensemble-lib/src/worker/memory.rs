//! Process memory observation

use std::sync::Arc;
use tracing::debug;

/// Source of the process' current memory use
pub trait MemorySampler: Send + Sync {
    /// Bytes in use, `None` if unknown
    fn used_bytes(&self) -> Option<u64>;
}

/// Resident set size from `/proc/self/status`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemorySampler;

impl MemorySampler for ProcessMemorySampler {
    fn used_bytes(&self) -> Option<u64> {
        match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => parse_vm_rss(&status),
            Err(e) => {
                debug!(error = %e, "Cannot read process status");
                None
            }
        }
    }
}

/// Parse the `VmRSS` line of a `/proc/<pid>/status` file into bytes
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}

/// Memory ceiling checked between worker phases
#[derive(Clone)]
pub struct MemoryGuard {
    limit_bytes: Option<u64>,
    sampler: Arc<dyn MemorySampler>,
}

impl MemoryGuard {
    pub fn new(limit_bytes: Option<u64>, sampler: Arc<dyn MemorySampler>) -> Self {
        Self { limit_bytes, sampler }
    }

    /// No ceiling
    pub fn unlimited() -> Self {
        Self::new(None, Arc::new(ProcessMemorySampler))
    }

    pub fn limit_bytes(&self) -> Option<u64> {
        self.limit_bytes
    }

    /// Bytes in use when above the ceiling
    pub fn exceeded(&self) -> Option<u64> {
        let limit = self.limit_bytes?;
        let used = self.sampler.used_bytes()?;
        (used > limit).then_some(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u64);

    impl MemorySampler for Fixed {
        fn used_bytes(&self) -> Option<u64> {
            Some(self.0)
        }
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tensemble-builder\nVmPeak:\t  20000 kB\nVmRSS:\t   12345 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(12345 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
        assert_eq!(parse_vm_rss("VmRSS:\t12 MB\n"), None);
    }

    #[test]
    fn test_guard_limits() {
        let guard = MemoryGuard::new(Some(100), Arc::new(Fixed(150)));
        assert_eq!(guard.exceeded(), Some(150));

        let guard = MemoryGuard::new(Some(200), Arc::new(Fixed(150)));
        assert_eq!(guard.exceeded(), None);

        let guard = MemoryGuard::new(None, Arc::new(Fixed(u64::MAX)));
        assert_eq!(guard.exceeded(), None);
    }

    #[test]
    fn test_process_sampler_reports_memory() {
        if std::path::Path::new("/proc/self/status").exists() {
            assert!(ProcessMemorySampler.used_bytes().unwrap_or(0) > 0);
        }
    }
}
