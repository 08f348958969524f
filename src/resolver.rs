//! Correlation between domains, host processes and VCPU threads.
//!
//! Domains and OS processes share no common key, so the owning process is
//! found by scanning command lines for the domain name, and VCPU thread IDs
//! are pulled out of the hypervisor's human-monitor output. The matched
//! thread's run-queue wait time then serves as a steal-time proxy for
//! hypervisors that do not report a VCPU delay themselves.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::error;

use crate::error::ScrapeError;
use crate::hypervisor::DomainRef;
use crate::proctable::{self, ProcessTable};

static THREAD_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"thread_id=([0-9]+)\s").expect("static pattern"));

/// Finds the OS process owning a domain by command-line substring match.
///
/// First match in enumeration order wins. The match is a documented
/// heuristic: a domain name that is a substring of another (vm-1 vs vm-10)
/// is inherently ambiguous and resolves to whichever process is enumerated
/// first.
pub fn resolve_domain_pid(domain_name: &str, table: &ProcessTable) -> Option<u32> {
    table.pids().iter().copied().find(|&pid| {
        let cmdline = table.cmdline(pid);
        !cmdline.is_empty() && cmdline.contains(domain_name)
    })
}

/// Resolves the live mapping from VCPU index to kernel thread ID by issuing
/// `info cpus` over the domain's monitor interface.
///
/// A hypervisor that rejects the command for the domain's current state
/// (e.g. not running) yields `Unsupported`, which is non-fatal to the scrape.
pub fn resolve_vcpu_threads(domain: &dyn DomainRef) -> Result<Vec<u32>, ScrapeError> {
    match domain.monitor_command("info cpus") {
        Ok(output) => Ok(parse_thread_ids(&output)),
        Err(ScrapeError::Unsupported(msg)) | Err(ScrapeError::InvalidOperation(msg)) => {
            Err(ScrapeError::Unsupported(msg))
        }
        Err(err) => Err(err),
    }
}

/// Extracts `thread_id=<digits>` values from monitor output, in order.
///
/// Expected shape:
/// ```text
/// * CPU #0: thread_id=151260
///   CPU #1: thread_id=151261
/// ```
pub fn parse_thread_ids(monitor_output: &str) -> Vec<u32> {
    THREAD_ID_RE
        .captures_iter(monitor_output)
        .filter_map(|cap| cap[1].parse().ok())
        .collect()
}

/// Estimates a VCPU's scheduling delay, in seconds, from the matched
/// thread's run-queue wait time.
///
/// A `vcpu_index` beyond the resolved thread list means the domain uses
/// fewer active VCPUs than its configured maximum; the VCPU is skipped
/// silently. A failed schedstat read is logged and skipped.
pub fn estimate_delay_seconds(
    task_root: &Path,
    vcpu_threads: &[u32],
    vcpu_index: usize,
) -> Option<f64> {
    let tid = *vcpu_threads.get(vcpu_index)?;
    match proctable::sched_stat(task_root, tid) {
        Ok(stat) => Some(stat.run_queue_ns as f64 / 1e9),
        Err(err) => {
            error!(tid, %err, "unable to collect vcpu delay metric");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn proc_with(cmdlines: &[(u32, &str)]) -> (TempDir, ProcessTable) {
        let dir = TempDir::new().unwrap();
        for (pid, cmdline) in cmdlines {
            let p = dir.path().join(pid.to_string());
            fs::create_dir_all(&p).unwrap();
            fs::write(p.join("cmdline"), cmdline).unwrap();
        }
        let table = ProcessTable::refresh(dir.path()).unwrap();
        (dir, table)
    }

    #[test]
    fn test_resolve_domain_pid_matches_substring() {
        let (_dir, table) = proc_with(&[
            (1, "init\0"),
            (100, "qemu-system-x86_64\0-name\0guest=vm-1,debug-threads=on\0"),
        ]);
        assert_eq!(resolve_domain_pid("vm-1", &table), Some(100));
        assert_eq!(resolve_domain_pid("vm-2", &table), None);
    }

    #[test]
    fn test_resolve_domain_pid_substring_ambiguity_is_order_dependent() {
        // Known limitation: "vm-1" is a substring of "vm-10", so whichever
        // process the table enumerates first wins.
        let (_dir, table) = proc_with(&[(100, "qemu\0guest=vm-10\0")]);
        assert_eq!(resolve_domain_pid("vm-1", &table), Some(100));
    }

    #[test]
    fn test_parse_thread_ids_in_order() {
        let output = "* CPU #0: thread_id=151260\n  CPU #1: thread_id=151261\n";
        assert_eq!(parse_thread_ids(output), vec![151260, 151261]);
    }

    #[test]
    fn test_parse_thread_ids_ignores_unrelated_text() {
        let output = "info cpus\nno threads here\n";
        assert!(parse_thread_ids(output).is_empty());
    }

    #[test]
    fn test_estimate_reads_run_queue_wait_in_seconds() {
        let dir = TempDir::new().unwrap();
        let task = dir.path().join("100").join("task");
        fs::create_dir_all(task.join("150")).unwrap();
        fs::write(task.join("150").join("schedstat"), "1000000 5000000000 12\n").unwrap();

        let delay = estimate_delay_seconds(&task, &[150], 0);
        assert_eq!(delay, Some(5.0));
    }

    #[test]
    fn test_estimate_skips_vcpu_index_beyond_active_threads() {
        // vcpu.maximum can exceed vcpu.current; those indexes carry no
        // thread and produce no estimate.
        let dir = TempDir::new().unwrap();
        assert_eq!(estimate_delay_seconds(dir.path(), &[150], 4), None);
    }

    #[test]
    fn test_estimate_tolerates_missing_schedstat() {
        let dir = TempDir::new().unwrap();
        assert_eq!(estimate_delay_seconds(dir.path(), &[150], 0), None);
    }
}
