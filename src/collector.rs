//! Scrape orchestration and the per-domain metric mapper.
//!
//! One scrape opens a fresh connection, reports component versions,
//! refreshes the process table, maps every domain from the batched
//! statistics snapshot, maps every active storage pool, and reports the
//! overall `libvirt_up` gauge. Everything is sequential and synchronous;
//! the first unhandled mapper error aborts all remaining domains and pools.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, error, warn};

use crate::error::ScrapeError;
use crate::hypervisor::{
    BlockStat, Connection, Connector, DomainRef, DomainStats, MemoryStat, PoolRef,
    MEM_STAT_ACTUAL_BALLOON,
    MEM_STAT_AVAILABLE, MEM_STAT_DISK_CACHES, MEM_STAT_MAJOR_FAULT, MEM_STAT_MINOR_FAULT,
    MEM_STAT_RSS, MEM_STAT_UNUSED, MEM_STAT_USABLE,
};
use crate::metrics::{self, MetricDesc, MetricRecord};
use crate::proctable::ProcessTable;
use crate::resolver;
use crate::schema::DomainDescriptor;

/// Synthetic CD-ROM devices that must not produce block metrics.
const CDROM_DEVICES: [&str; 2] = ["hdc", "hda"];

/// Result of one collection cycle.
#[derive(Debug)]
pub struct ScrapeOutput {
    /// Ordered metric records, `libvirt_up` last.
    pub records: Vec<MetricRecord>,
    /// Whether the scrape completed without an unhandled error.
    pub up: bool,
}

/// Per-scrape collection state: the refreshed process table plus the
/// process-lifetime set of error classes already reported once.
struct ScrapeContext<'a> {
    table: ProcessTable,
    seen_errors: &'a mut HashSet<&'static str>,
}

impl ScrapeContext<'_> {
    /// Reports an error class at most once per process lifetime, to avoid
    /// log flooding for permanently-unsupported hypervisor features.
    fn error_once(&mut self, class: &'static str, err: &ScrapeError) {
        if self.seen_errors.insert(class) {
            error!(class, %err, "unsupported hypervisor operation");
        }
    }
}

/// Drives complete collection cycles against one connection URI.
///
/// Scrapes are serialized: the mutex gate both protects the one-shot error
/// set and guarantees that concurrent exposition requests cannot interleave
/// two collection cycles.
pub struct Exporter {
    uri: String,
    proc_root: PathBuf,
    connector: Box<dyn Connector + Send + Sync>,
    seen_errors: Mutex<HashSet<&'static str>>,
}

impl Exporter {
    pub fn new(
        connector: Box<dyn Connector + Send + Sync>,
        uri: impl Into<String>,
        proc_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            uri: uri.into(),
            proc_root: proc_root.into(),
            connector,
            seen_errors: Mutex::new(HashSet::new()),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Runs one full collection cycle. Never fails: an unhandled error is
    /// logged, already-emitted records are kept, and `libvirt_up` reports 0.
    pub fn scrape(&self) -> ScrapeOutput {
        let mut seen = self
            .seen_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut records = Vec::new();
        let up = match self.try_scrape(&mut seen, &mut records) {
            Ok(()) => true,
            Err(err) => {
                error!(uri = %self.uri, %err, "failed to scrape libvirt metrics");
                false
            }
        };
        push(&mut records, &metrics::UP, if up { 1.0 } else { 0.0 }, &[]);

        ScrapeOutput { records, up }
    }

    fn try_scrape(
        &self,
        seen_errors: &mut HashSet<&'static str>,
        out: &mut Vec<MetricRecord>,
    ) -> Result<(), ScrapeError> {
        let conn = self.connector.connect(&self.uri)?;

        let versions = conn.versions()?;
        push(
            out,
            &metrics::VERSIONS_INFO,
            1.0,
            &[&versions.hypervisor, &versions.daemon, &versions.library],
        );

        let mut ctx = ScrapeContext {
            table: ProcessTable::refresh(&self.proc_root)?,
            seen_errors,
        };

        let stats = conn.all_domain_stats()?;
        debug!(domains = stats.len(), "collected domain statistics batch");
        for stat in &stats {
            collect_domain(&mut ctx, stat, out)?;
        }

        for pool in conn.active_pools()? {
            collect_pool(pool.as_ref(), out)?;
        }

        Ok(())
    }
}

/// Maps one domain's raw statistics, decoded descriptor and resolved
/// process data into metric records.
fn collect_domain(
    ctx: &mut ScrapeContext,
    stat: &DomainStats,
    out: &mut Vec<MetricRecord>,
) -> Result<(), ScrapeError> {
    let domain = stat.domain.as_ref();
    let name = domain.name()?;

    let domain_pid = resolver::resolve_domain_pid(&name, &ctx.table);
    let vcpu_threads = match resolver::resolve_vcpu_threads(domain) {
        Ok(threads) => threads,
        Err(err @ ScrapeError::Unsupported(_)) => {
            debug!(domain = %name, %err, "vcpu thread introspection unavailable");
            Vec::new()
        }
        Err(err) => return Err(err),
    };

    let uuid = domain.uuid()?;

    let desc = match DomainDescriptor::decode(&domain.xml_desc()?) {
        Ok(desc) => desc,
        Err(err) => {
            warn!(domain = %name, %err, "failed to decode domain description");
            DomainDescriptor::default()
        }
    };

    let info = domain.info()?;
    let instance = &desc.instance;
    push(
        out,
        &metrics::DOMAIN_INFO_META,
        1.0,
        &[
            &name,
            &uuid,
            &instance.name,
            &instance.flavor.name,
            &instance.owner.user.name,
            &instance.owner.user.uuid,
            &instance.owner.project.name,
            &instance.owner.project.uuid,
            &instance.root.root_type,
            &instance.root.uuid,
        ],
    );
    push(
        out,
        &metrics::DOMAIN_INFO_MAX_MEM,
        info.max_mem_kib as f64 * 1024.0,
        &[&name],
    );
    push(
        out,
        &metrics::DOMAIN_INFO_MEMORY_USAGE,
        info.memory_kib as f64 * 1024.0,
        &[&name],
    );
    push(
        out,
        &metrics::DOMAIN_INFO_NR_VIRT_CPU,
        info.nr_virt_cpu as f64,
        &[&name],
    );
    push(
        out,
        &metrics::DOMAIN_INFO_CPU_TIME,
        ns_to_secs(info.cpu_time_ns),
        &[&name],
    );
    push(
        out,
        &metrics::DOMAIN_INFO_STATE,
        info.state as u32 as f64,
        &[&name],
    );

    collect_vcpus(ctx, stat, domain_pid, &vcpu_threads, &name, out)?;
    collect_blocks(ctx, stat, &desc, &name, out)?;
    collect_interfaces(stat, &desc, &name, out);
    collect_memory(stat, &name, out);

    Ok(())
}

fn collect_vcpus(
    ctx: &mut ScrapeContext,
    stat: &DomainStats,
    domain_pid: Option<u32>,
    vcpu_threads: &[u32],
    name: &str,
    out: &mut Vec<MetricRecord>,
) -> Result<(), ScrapeError> {
    match stat.domain.vcpu_info() {
        Ok(vcpus) => {
            for vcpu in vcpus {
                let index = vcpu.number.to_string();
                push(out, &metrics::VCPU_STATE, vcpu.state as f64, &[name, &index]);
                push(
                    out,
                    &metrics::VCPU_TIME,
                    ns_to_secs(vcpu.cpu_time_ns),
                    &[name, &index],
                );
                push(out, &metrics::VCPU_CPU, vcpu.cpu as f64, &[name, &index]);
            }
        }
        Err(err @ (ScrapeError::Unsupported(_) | ScrapeError::InvalidOperation(_))) => {
            debug!(domain = %name, %err, "vcpu info unavailable");
        }
        Err(err) => return Err(err),
    }

    // The batch carries wait and delay per VCPU; the info call above does
    // not. Exactly one delay value is emitted per VCPU: the hypervisor's if
    // present, the schedstat estimate otherwise, nothing if neither exists.
    for (index, vcpu) in stat.vcpus.iter().enumerate() {
        let label = index.to_string();
        if let Some(wait_ns) = vcpu.wait_ns {
            push(out, &metrics::VCPU_WAIT, ns_to_secs(wait_ns), &[name, &label]);
        }
        if let Some(delay_ns) = vcpu.delay_ns {
            push(out, &metrics::VCPU_DELAY, ns_to_secs(delay_ns), &[name, &label]);
        } else if let Some(pid) = domain_pid {
            let task_root = ctx.table.task_root(pid);
            if let Some(delay) = resolver::estimate_delay_seconds(&task_root, vcpu_threads, index)
            {
                push(out, &metrics::VCPU_DELAY, delay, &[name, &label]);
            }
        }
    }

    Ok(())
}

fn collect_blocks(
    ctx: &mut ScrapeContext,
    stat: &DomainStats,
    desc: &DomainDescriptor,
    name: &str,
    out: &mut Vec<MetricRecord>,
) -> Result<(), ScrapeError> {
    for disk in &stat.blocks {
        if CDROM_DEVICES.contains(&disk.name.as_str()) {
            continue;
        }

        let device = desc.disk(&disk.name);
        // The batch omits the path for network sources (e.g. rbd); fall
        // back to the source name from the domain description.
        let source = disk
            .path
            .clone()
            .unwrap_or_else(|| device.source.name.clone());

        push(
            out,
            &metrics::BLOCK_META,
            1.0,
            &[
                name,
                &disk.name,
                &source,
                &device.serial,
                &device.target.bus,
                &device.disk_type,
                &device.driver.driver_type,
                &device.driver.cache,
                &device.driver.discard,
            ],
        );

        push_present(out, block_counters(disk), &[name, &disk.name]);

        match stat.domain.block_iotune(&disk.name) {
            Ok(tune) => {
                let limits: [(&'static MetricDesc, Option<u64>); 19] = [
                    (&metrics::BLOCK_LIMIT_TOTAL_BYTES, tune.total_bytes_sec),
                    (&metrics::BLOCK_LIMIT_READ_BYTES, tune.read_bytes_sec),
                    (&metrics::BLOCK_LIMIT_WRITE_BYTES, tune.write_bytes_sec),
                    (&metrics::BLOCK_LIMIT_TOTAL_REQUESTS, tune.total_iops_sec),
                    (&metrics::BLOCK_LIMIT_READ_REQUESTS, tune.read_iops_sec),
                    (&metrics::BLOCK_LIMIT_WRITE_REQUESTS, tune.write_iops_sec),
                    (
                        &metrics::BLOCK_LIMIT_BURST_TOTAL_BYTES,
                        tune.total_bytes_sec_max,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_READ_BYTES,
                        tune.read_bytes_sec_max,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_WRITE_BYTES,
                        tune.write_bytes_sec_max,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_TOTAL_REQUESTS,
                        tune.total_iops_sec_max,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_READ_REQUESTS,
                        tune.read_iops_sec_max,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_WRITE_REQUESTS,
                        tune.write_iops_sec_max,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_TOTAL_BYTES_LENGTH,
                        tune.total_bytes_sec_max_length,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_READ_BYTES_LENGTH,
                        tune.read_bytes_sec_max_length,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_WRITE_BYTES_LENGTH,
                        tune.write_bytes_sec_max_length,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_TOTAL_REQUESTS_LENGTH,
                        tune.total_iops_sec_max_length,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_READ_REQUESTS_LENGTH,
                        tune.read_iops_sec_max_length,
                    ),
                    (
                        &metrics::BLOCK_LIMIT_BURST_WRITE_REQUESTS_LENGTH,
                        tune.write_iops_sec_max_length,
                    ),
                    (&metrics::BLOCK_SIZE_IOPS, tune.size_iops_sec),
                ];
                push_present(
                    out,
                    limits.map(|(d, v)| (d, v.map(|n| n as f64))),
                    &[name, &disk.name],
                );
            }
            // Inapplicable to the current domain state: logged on every
            // occurrence, matching the source.
            Err(err @ ScrapeError::InvalidOperation(_)) => {
                error!(domain = %name, device = %disk.name, %err, "invalid operation querying block I/O limits");
            }
            Err(err @ ScrapeError::Unsupported(_)) => {
                ctx.error_once("blkiotune_unsupported", &err);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

fn block_counters(disk: &BlockStat) -> [(&'static MetricDesc, Option<f64>); 11] {
    let raw = |v: Option<u64>| v.map(|n| n as f64);
    let secs = |v: Option<u64>| v.map(ns_to_secs);
    [
        (&metrics::BLOCK_READ_BYTES, raw(disk.rd_bytes)),
        (&metrics::BLOCK_READ_REQUESTS, raw(disk.rd_requests)),
        (&metrics::BLOCK_READ_TIME, secs(disk.rd_time_ns)),
        (&metrics::BLOCK_WRITE_BYTES, raw(disk.wr_bytes)),
        (&metrics::BLOCK_WRITE_REQUESTS, raw(disk.wr_requests)),
        (&metrics::BLOCK_WRITE_TIME, secs(disk.wr_time_ns)),
        (&metrics::BLOCK_FLUSH_REQUESTS, raw(disk.flush_requests)),
        (&metrics::BLOCK_FLUSH_TIME, secs(disk.flush_time_ns)),
        (&metrics::BLOCK_ALLOCATION, raw(disk.allocation)),
        (&metrics::BLOCK_CAPACITY, raw(disk.capacity)),
        (&metrics::BLOCK_PHYSICAL_SIZE, raw(disk.physical)),
    ]
}

fn collect_interfaces(
    stat: &DomainStats,
    desc: &DomainDescriptor,
    name: &str,
    out: &mut Vec<MetricRecord>,
) {
    for iface in &stat.interfaces {
        let net = desc.interface(&iface.name);
        let bridge = &net.source.bridge;
        let virtual_interface = &net.virtual_port.parameters.interface_id;
        if !bridge.is_empty() || !virtual_interface.is_empty() {
            push(
                out,
                &metrics::INTERFACE_META,
                1.0,
                &[name, bridge, &iface.name, virtual_interface],
            );
        }

        let raw = |v: Option<u64>| v.map(|n| n as f64);
        let counters: [(&'static MetricDesc, Option<f64>); 8] = [
            (&metrics::INTERFACE_RX_BYTES, raw(iface.rx_bytes)),
            (&metrics::INTERFACE_RX_PACKETS, raw(iface.rx_packets)),
            (&metrics::INTERFACE_RX_ERRORS, raw(iface.rx_errors)),
            (&metrics::INTERFACE_RX_DROPS, raw(iface.rx_drops)),
            (&metrics::INTERFACE_TX_BYTES, raw(iface.tx_bytes)),
            (&metrics::INTERFACE_TX_PACKETS, raw(iface.tx_packets)),
            (&metrics::INTERFACE_TX_ERRORS, raw(iface.tx_errors)),
            (&metrics::INTERFACE_TX_DROPS, raw(iface.tx_drops)),
        ];
        push_present(out, counters, &[name, &iface.name]);
    }
}

/// Aggregated memory statistics, zero-valued for absent tags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct MemoryTotals {
    major_fault: u64,
    minor_fault: u64,
    unused_kib: u64,
    available_kib: u64,
    actual_balloon_kib: u64,
    rss_kib: u64,
    usable_kib: u64,
    disk_caches_kib: u64,
}

impl MemoryTotals {
    fn from_stats(stats: &[MemoryStat]) -> Self {
        let mut totals = Self::default();
        for stat in stats {
            match stat.tag {
                MEM_STAT_MAJOR_FAULT => totals.major_fault = stat.value_kib,
                MEM_STAT_MINOR_FAULT => totals.minor_fault = stat.value_kib,
                MEM_STAT_UNUSED => totals.unused_kib = stat.value_kib,
                MEM_STAT_AVAILABLE => totals.available_kib = stat.value_kib,
                MEM_STAT_ACTUAL_BALLOON => totals.actual_balloon_kib = stat.value_kib,
                MEM_STAT_RSS => totals.rss_kib = stat.value_kib,
                MEM_STAT_USABLE => totals.usable_kib = stat.value_kib,
                MEM_STAT_DISK_CACHES => totals.disk_caches_kib = stat.value_kib,
                _ => {}
            }
        }
        totals
    }
}

/// Share of guest memory in use, derived from the balloon statistics.
/// Zero when either input is zero (stats unavailable or balloon inactive).
fn memory_used_percent(available_kib: u64, usable_kib: u64) -> f64 {
    if available_kib == 0 || usable_kib == 0 {
        return 0.0;
    }
    (available_kib as f64 - usable_kib as f64) / (available_kib as f64 / 100.0)
}

fn collect_memory(stat: &DomainStats, name: &str, out: &mut Vec<MetricRecord>) {
    // Memory fields are always emitted in full: a failed stats call
    // zero-fills them rather than dropping the series.
    let totals = match stat.domain.memory_stats() {
        Ok(stats) => MemoryTotals::from_stats(&stats),
        Err(err) => {
            debug!(domain = %name, %err, "memory stats unavailable");
            MemoryTotals::default()
        }
    };
    let used_percent = memory_used_percent(totals.available_kib, totals.usable_kib);

    let kib = |v: u64| v as f64 * 1024.0;
    push(out, &metrics::MEMORY_MAJOR_FAULT, totals.major_fault as f64, &[name]);
    push(out, &metrics::MEMORY_MINOR_FAULT, totals.minor_fault as f64, &[name]);
    push(out, &metrics::MEMORY_UNUSED, kib(totals.unused_kib), &[name]);
    push(out, &metrics::MEMORY_AVAILABLE, kib(totals.available_kib), &[name]);
    push(
        out,
        &metrics::MEMORY_ACTUAL_BALLOON,
        kib(totals.actual_balloon_kib),
        &[name],
    );
    push(out, &metrics::MEMORY_RSS, kib(totals.rss_kib), &[name]);
    push(out, &metrics::MEMORY_USABLE, kib(totals.usable_kib), &[name]);
    push(
        out,
        &metrics::MEMORY_DISK_CACHE,
        kib(totals.disk_caches_kib),
        &[name],
    );
    push(out, &metrics::MEMORY_USED_PERCENT, used_percent, &[name]);
}

/// Maps one storage pool: refresh, then capacity/allocation/available.
fn collect_pool(pool: &dyn PoolRef, out: &mut Vec<MetricRecord>) -> Result<(), ScrapeError> {
    pool.refresh()?;
    let name = pool.name()?;
    let info = pool.info()?;

    push(out, &metrics::POOL_CAPACITY, info.capacity_bytes as f64, &[&name]);
    push(
        out,
        &metrics::POOL_ALLOCATION,
        info.allocation_bytes as f64,
        &[&name],
    );
    push(
        out,
        &metrics::POOL_AVAILABLE,
        info.available_bytes as f64,
        &[&name],
    );
    Ok(())
}

fn ns_to_secs(ns: u64) -> f64 {
    ns as f64 / 1e9
}

fn push(out: &mut Vec<MetricRecord>, desc: &'static MetricDesc, value: f64, labels: &[&str]) {
    out.push(MetricRecord::new(
        desc,
        value,
        labels.iter().map(|s| s.to_string()).collect(),
    ));
}

/// Emits one record per present field; absent fields produce no series.
fn push_present<const N: usize>(
    out: &mut Vec<MetricRecord>,
    fields: [(&'static MetricDesc, Option<f64>); N],
    labels: &[&str],
) {
    for (desc, value) in fields {
        if let Some(value) = value {
            push(out, desc, value, labels);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_used_percent_zero_when_either_input_is_zero() {
        assert_eq!(memory_used_percent(0, 100), 0.0);
        assert_eq!(memory_used_percent(100, 0), 0.0);
    }

    #[test]
    fn test_memory_used_percent_within_bounds() {
        // usable <= available keeps the share in [0, 100].
        let percent = memory_used_percent(4_000_000, 1_000_000);
        assert_eq!(percent, 75.0);
        assert!((0.0..=100.0).contains(&percent));
        assert_eq!(memory_used_percent(4_000_000, 4_000_000), 0.0);
    }

    #[test]
    fn test_memory_totals_pick_known_tags() {
        let stats = [
            MemoryStat { tag: MEM_STAT_MAJOR_FAULT, value_kib: 7 },
            MemoryStat { tag: MEM_STAT_AVAILABLE, value_kib: 2048 },
            MemoryStat { tag: MEM_STAT_USABLE, value_kib: 1024 },
            MemoryStat { tag: 99, value_kib: 555 },
        ];
        let totals = MemoryTotals::from_stats(&stats);
        assert_eq!(totals.major_fault, 7);
        assert_eq!(totals.available_kib, 2048);
        assert_eq!(totals.usable_kib, 1024);
        assert_eq!(totals.rss_kib, 0);
    }

    #[test]
    fn test_push_present_skips_absent_fields() {
        let mut out = Vec::new();
        push_present(
            &mut out,
            [
                (&metrics::BLOCK_READ_BYTES, Some(1.0)),
                (&metrics::BLOCK_WRITE_BYTES, None),
            ],
            &["vm-1", "vda"],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].desc.name, metrics::BLOCK_READ_BYTES.name);
    }
}
