//! Kernel process table access.
//!
//! Enumerates OS-level processes from a procfs mount and exposes the two
//! lookups the collector needs: command-line text by PID and scheduler
//! statistics for a thread under a process's task namespace. The listing is
//! recomputed once per scrape and held only for that scrape's duration.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ScrapeError;

/// Default procfs mountpoint.
pub const DEFAULT_MOUNT_POINT: &str = "/proc";

/// Fields of a `/proc/<pid>/schedstat` file.
/// cf. https://www.kernel.org/doc/Documentation/scheduler/sched-stats.txt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedStat {
    /// Time spent on the cpu, in nanoseconds.
    pub cpu_time_ns: u64,
    /// Time spent waiting on a runqueue, in nanoseconds.
    pub run_queue_ns: u64,
    /// Number of timeslices run on this cpu.
    pub timeslices: u64,
}

/// Snapshot of the process listing under one procfs mount.
#[derive(Debug, Clone)]
pub struct ProcessTable {
    root: PathBuf,
    pids: Vec<u32>,
}

impl ProcessTable {
    /// Scans the procfs mount for integer-named process directories. An
    /// unreadable mount is an error: metric collection is impossible
    /// without the process table.
    pub fn refresh(root: &Path) -> Result<Self, ScrapeError> {
        let entries = fs::read_dir(root).map_err(|e| {
            ScrapeError::Query(format!("cannot read procfs at {}: {e}", root.display()))
        })?;

        let mut pids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = match path.file_name().and_then(|s| s.to_str()) {
                Some(v) => v,
                None => continue,
            };
            if let Ok(pid) = name.parse::<u32>() {
                pids.push(pid);
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            pids,
        })
    }

    /// Process IDs found at refresh time, in directory-read order. The order
    /// is unspecified.
    pub fn pids(&self) -> &[u32] {
        &self.pids
    }

    /// Command line of a process. Empty string on any read failure: a
    /// process vanishing between listing and read is not an error.
    pub fn cmdline(&self, pid: u32) -> String {
        let path = self.root.join(pid.to_string()).join("cmdline");
        match fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        }
    }

    /// Root of a process's task namespace, under which its thread IDs live.
    pub fn task_root(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string()).join("task")
    }
}

/// Reads the scheduler statistics of a thread under `task_root`. Read fresh
/// on each request, never cached.
pub fn sched_stat(task_root: &Path, tid: u32) -> Result<SchedStat, ScrapeError> {
    let path = task_root.join(tid.to_string()).join("schedstat");
    let content = fs::read_to_string(&path)
        .map_err(|_| ScrapeError::NotFound(path.display().to_string()))?;

    let mut fields = content.split_whitespace().map(str::parse::<u64>);
    let mut next = || {
        fields
            .next()
            .and_then(Result::ok)
            .ok_or_else(|| ScrapeError::Parse(format!("schedstat {}", path.display())))
    };

    Ok(SchedStat {
        cpu_time_ns: next()?,
        run_queue_ns: next()?,
        timeslices: next()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_proc() -> TempDir {
        let dir = TempDir::new().unwrap();
        for (pid, cmdline) in [(1, "init\0"), (100, "qemu-system-x86_64\0-name\0vm-1\0")] {
            let p = dir.path().join(pid.to_string());
            fs::create_dir_all(&p).unwrap();
            fs::write(p.join("cmdline"), cmdline).unwrap();
        }
        // Non-process entries that the scan must skip.
        fs::create_dir_all(dir.path().join("sys")).unwrap();
        fs::write(dir.path().join("uptime"), "12345.67 89.01").unwrap();
        dir
    }

    #[test]
    fn test_refresh_lists_only_numeric_directories() {
        let dir = fake_proc();
        let table = ProcessTable::refresh(dir.path()).unwrap();
        let mut pids = table.pids().to_vec();
        pids.sort_unstable();
        assert_eq!(pids, vec![1, 100]);
    }

    #[test]
    fn test_refresh_fails_on_unreadable_mount() {
        let err = ProcessTable::refresh(Path::new("/definitely/not/a/procfs")).unwrap_err();
        assert!(matches!(err, ScrapeError::Query(_)));
    }

    #[test]
    fn test_cmdline_of_vanished_process_is_empty() {
        let dir = fake_proc();
        let table = ProcessTable::refresh(dir.path()).unwrap();
        assert_eq!(table.cmdline(4242), "");
    }

    #[test]
    fn test_cmdline_keeps_argument_separators_searchable() {
        let dir = fake_proc();
        let table = ProcessTable::refresh(dir.path()).unwrap();
        let cmdline = table.cmdline(100);
        assert!(cmdline.contains("vm-1"));
        assert!(cmdline.contains("qemu-system-x86_64"));
    }

    #[test]
    fn test_sched_stat_parses_three_fields() {
        let dir = TempDir::new().unwrap();
        let task = dir.path().join("100").join("task");
        fs::create_dir_all(task.join("150")).unwrap();
        fs::write(task.join("150").join("schedstat"), "123456789 5000000000 42\n").unwrap();

        let stat = sched_stat(&task, 150).unwrap();
        assert_eq!(stat.cpu_time_ns, 123_456_789);
        assert_eq!(stat.run_queue_ns, 5_000_000_000);
        assert_eq!(stat.timeslices, 42);
    }

    #[test]
    fn test_sched_stat_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = sched_stat(dir.path(), 999).unwrap_err();
        assert!(matches!(err, ScrapeError::NotFound(_)));
        assert!(err.is_tolerated());
    }

    #[test]
    fn test_sched_stat_malformed_file_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let task = dir.path().join("task");
        fs::create_dir_all(task.join("7")).unwrap();
        fs::write(task.join("7").join("schedstat"), "123 garbage").unwrap();
        let err = sched_stat(&task, 7).unwrap_err();
        assert!(matches!(err, ScrapeError::Parse(_)));
    }
}
