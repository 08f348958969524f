//! Metric descriptor catalogue and record type.
//!
//! Every metric series this exporter can emit is described here, once, as
//! `const` data. The set of names and label names is fixed at process start
//! and never varies by scrape; only label values and sample values do.

/// Whether a metric is a gauge or a monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    /// Prometheus text-format TYPE keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

/// Immutable description of one metric family.
#[derive(Debug, PartialEq, Eq)]
pub struct MetricDesc {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub labels: &'static [&'static str],
}

const fn gauge(
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
) -> MetricDesc {
    MetricDesc {
        name,
        help,
        kind: MetricKind::Gauge,
        labels,
    }
}

const fn counter(
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
) -> MetricDesc {
    MetricDesc {
        name,
        help,
        kind: MetricKind::Counter,
        labels,
    }
}

const DOMAIN: &[&str] = &["domain"];
const DOMAIN_VCPU: &[&str] = &["domain", "vcpu"];
const DOMAIN_DEVICE: &[&str] = &["domain", "target_device"];
const POOL: &[&str] = &["pool"];

// ========== Status and versions ==========

pub static UP: MetricDesc = gauge(
    "libvirt_up",
    "Whether scraping libvirt's metrics was successful.",
    &[],
);
pub static VERSIONS_INFO: MetricDesc = gauge(
    "libvirt_versions_info",
    "Versions of virtualization components",
    &["hypervisor_running", "libvirtd_running", "libvirt_library"],
);

// ========== Storage pool info ==========

pub static POOL_CAPACITY: MetricDesc =
    gauge("libvirt_pool_info_capacity_bytes", "Pool capacity, in bytes", POOL);
pub static POOL_ALLOCATION: MetricDesc = gauge(
    "libvirt_pool_info_allocation_bytes",
    "Pool allocation, in bytes",
    POOL,
);
pub static POOL_AVAILABLE: MetricDesc = gauge(
    "libvirt_pool_info_available_bytes",
    "Pool available, in bytes",
    POOL,
);

// ========== Domain info ==========

pub static DOMAIN_INFO_META: MetricDesc = gauge(
    "libvirt_domain_info_meta",
    "Domain metadata",
    &[
        "domain",
        "uuid",
        "instance_name",
        "flavor",
        "user_name",
        "user_uuid",
        "project_name",
        "project_uuid",
        "root_type",
        "root_uuid",
    ],
);
pub static DOMAIN_INFO_MAX_MEM: MetricDesc = gauge(
    "libvirt_domain_info_maximum_memory_bytes",
    "Maximum allowed memory of the domain, in bytes.",
    DOMAIN,
);
pub static DOMAIN_INFO_MEMORY_USAGE: MetricDesc = gauge(
    "libvirt_domain_info_memory_usage_bytes",
    "Memory usage of the domain, in bytes.",
    DOMAIN,
);
pub static DOMAIN_INFO_NR_VIRT_CPU: MetricDesc = gauge(
    "libvirt_domain_info_virtual_cpus",
    "Number of virtual CPUs for the domain.",
    DOMAIN,
);
pub static DOMAIN_INFO_CPU_TIME: MetricDesc = counter(
    "libvirt_domain_info_cpu_time_seconds_total",
    "Amount of CPU time used by the domain, in seconds.",
    DOMAIN,
);
pub static DOMAIN_INFO_STATE: MetricDesc = gauge(
    "libvirt_domain_info_vstate",
    "Virtual domain state. 0: no state, 1: the domain is running, 2: the domain is blocked on resource, \
     3: the domain is paused by user, 4: the domain is being shut down, 5: the domain is shut off, \
     6: the domain is crashed, 7: the domain is suspended by guest power management",
    DOMAIN,
);

// ========== VCPU ==========

pub static VCPU_TIME: MetricDesc = counter(
    "libvirt_domain_vcpu_time_seconds_total",
    "Amount of CPU time used by the domain's VCPU, in seconds.",
    DOMAIN_VCPU,
);
pub static VCPU_DELAY: MetricDesc = counter(
    "libvirt_domain_vcpu_delay_seconds_total",
    "Time the vcpu thread was enqueued by the host scheduler, but was waiting in the queue \
     instead of running. Exposed to the VM as a steal time.",
    DOMAIN_VCPU,
);
pub static VCPU_STATE: MetricDesc = gauge(
    "libvirt_domain_vcpu_state",
    "VCPU state. 0: offline, 1: running, 2: blocked",
    DOMAIN_VCPU,
);
pub static VCPU_CPU: MetricDesc = gauge(
    "libvirt_domain_vcpu_cpu",
    "Real CPU number, or one of the values from virVcpuHostCpuState",
    DOMAIN_VCPU,
);
pub static VCPU_WAIT: MetricDesc = counter(
    "libvirt_domain_vcpu_wait_seconds_total",
    "Vcpu's wait_sum metric. CONFIG_SCHEDSTATS has to be enabled",
    DOMAIN_VCPU,
);

// ========== Block devices ==========

pub static BLOCK_META: MetricDesc = gauge(
    "libvirt_domain_block_meta",
    "Block device metadata info. Device name, source file, serial.",
    &[
        "domain",
        "target_device",
        "source_file",
        "serial",
        "bus",
        "disk_type",
        "driver_type",
        "cache",
        "discard",
    ],
);
pub static BLOCK_READ_BYTES: MetricDesc = counter(
    "libvirt_domain_block_stats_read_bytes_total",
    "Number of bytes read from a block device, in bytes.",
    DOMAIN_DEVICE,
);
pub static BLOCK_READ_REQUESTS: MetricDesc = counter(
    "libvirt_domain_block_stats_read_requests_total",
    "Number of read requests from a block device.",
    DOMAIN_DEVICE,
);
pub static BLOCK_READ_TIME: MetricDesc = counter(
    "libvirt_domain_block_stats_read_time_seconds_total",
    "Total time spent on reads from a block device, in seconds.",
    DOMAIN_DEVICE,
);
pub static BLOCK_WRITE_BYTES: MetricDesc = counter(
    "libvirt_domain_block_stats_write_bytes_total",
    "Number of bytes written to a block device, in bytes.",
    DOMAIN_DEVICE,
);
pub static BLOCK_WRITE_REQUESTS: MetricDesc = counter(
    "libvirt_domain_block_stats_write_requests_total",
    "Number of write requests to a block device.",
    DOMAIN_DEVICE,
);
pub static BLOCK_WRITE_TIME: MetricDesc = counter(
    "libvirt_domain_block_stats_write_time_seconds_total",
    "Total time spent on writes on a block device, in seconds",
    DOMAIN_DEVICE,
);
pub static BLOCK_FLUSH_REQUESTS: MetricDesc = counter(
    "libvirt_domain_block_stats_flush_requests_total",
    "Total flush requests from a block device.",
    DOMAIN_DEVICE,
);
pub static BLOCK_FLUSH_TIME: MetricDesc = counter(
    "libvirt_domain_block_stats_flush_time_seconds_total",
    "Total time in seconds spent on cache flushing to a block device",
    DOMAIN_DEVICE,
);
pub static BLOCK_ALLOCATION: MetricDesc = gauge(
    "libvirt_domain_block_stats_allocation",
    "Offset of the highest written sector on a block device.",
    DOMAIN_DEVICE,
);
pub static BLOCK_CAPACITY: MetricDesc = gauge(
    "libvirt_domain_block_stats_capacity_bytes",
    "Logical size in bytes of the block device backing image.",
    DOMAIN_DEVICE,
);
pub static BLOCK_PHYSICAL_SIZE: MetricDesc = gauge(
    "libvirt_domain_block_stats_physicalsize_bytes",
    "Physical size in bytes of the container of the backing image.",
    DOMAIN_DEVICE,
);

// ========== Block I/O tuning limits ==========

pub static BLOCK_LIMIT_TOTAL_BYTES: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_total_bytes",
    "Total throughput limit in bytes per second",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_WRITE_BYTES: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_write_bytes",
    "Write throughput limit in bytes per second",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_READ_BYTES: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_read_bytes",
    "Read throughput limit in bytes per second",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_TOTAL_REQUESTS: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_total_requests",
    "Total requests per second limit",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_WRITE_REQUESTS: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_write_requests",
    "Write requests per second limit",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_READ_REQUESTS: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_read_requests",
    "Read requests per second limit",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_TOTAL_BYTES: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_total_bytes",
    "Total throughput burst limit in bytes per second",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_WRITE_BYTES: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_write_bytes",
    "Write throughput burst limit in bytes per second",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_READ_BYTES: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_read_bytes",
    "Read throughput burst limit in bytes per second",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_TOTAL_REQUESTS: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_total_requests",
    "Total requests per second burst limit",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_WRITE_REQUESTS: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_write_requests",
    "Write requests per second burst limit",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_READ_REQUESTS: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_read_requests",
    "Read requests per second burst limit",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_TOTAL_BYTES_LENGTH: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_total_bytes_length_seconds",
    "Total throughput burst time in seconds",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_WRITE_BYTES_LENGTH: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_write_bytes_length_seconds",
    "Write throughput burst time in seconds",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_READ_BYTES_LENGTH: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_read_bytes_length_seconds",
    "Read throughput burst time in seconds",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_TOTAL_REQUESTS_LENGTH: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_length_total_requests_seconds",
    "Total requests per second burst time in seconds",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_WRITE_REQUESTS_LENGTH: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_length_write_requests_seconds",
    "Write requests per second burst time in seconds",
    DOMAIN_DEVICE,
);
pub static BLOCK_LIMIT_BURST_READ_REQUESTS_LENGTH: MetricDesc = gauge(
    "libvirt_domain_block_stats_limit_burst_length_read_requests_seconds",
    "Read requests per second burst time in seconds",
    DOMAIN_DEVICE,
);
pub static BLOCK_SIZE_IOPS: MetricDesc = gauge(
    "libvirt_domain_block_stats_size_iops_bytes",
    "The size of IO operations per second permitted through a block device",
    DOMAIN_DEVICE,
);

// ========== Network interfaces ==========

pub static INTERFACE_META: MetricDesc = gauge(
    "libvirt_domain_interface_meta",
    "Interfaces metadata. Source bridge, target device, interface uuid",
    &["domain", "source_bridge", "target_device", "virtual_interface"],
);
pub static INTERFACE_RX_BYTES: MetricDesc = counter(
    "libvirt_domain_interface_stats_receive_bytes_total",
    "Number of bytes received on a network interface, in bytes.",
    DOMAIN_DEVICE,
);
pub static INTERFACE_RX_PACKETS: MetricDesc = counter(
    "libvirt_domain_interface_stats_receive_packets_total",
    "Number of packets received on a network interface.",
    DOMAIN_DEVICE,
);
pub static INTERFACE_RX_ERRORS: MetricDesc = counter(
    "libvirt_domain_interface_stats_receive_errors_total",
    "Number of packet receive errors on a network interface.",
    DOMAIN_DEVICE,
);
pub static INTERFACE_RX_DROPS: MetricDesc = counter(
    "libvirt_domain_interface_stats_receive_drops_total",
    "Number of packet receive drops on a network interface.",
    DOMAIN_DEVICE,
);
pub static INTERFACE_TX_BYTES: MetricDesc = counter(
    "libvirt_domain_interface_stats_transmit_bytes_total",
    "Number of bytes transmitted on a network interface, in bytes.",
    DOMAIN_DEVICE,
);
pub static INTERFACE_TX_PACKETS: MetricDesc = counter(
    "libvirt_domain_interface_stats_transmit_packets_total",
    "Number of packets transmitted on a network interface.",
    DOMAIN_DEVICE,
);
pub static INTERFACE_TX_ERRORS: MetricDesc = counter(
    "libvirt_domain_interface_stats_transmit_errors_total",
    "Number of packet transmit errors on a network interface.",
    DOMAIN_DEVICE,
);
pub static INTERFACE_TX_DROPS: MetricDesc = counter(
    "libvirt_domain_interface_stats_transmit_drops_total",
    "Number of packet transmit drops on a network interface.",
    DOMAIN_DEVICE,
);

// ========== Memory stats ==========

pub static MEMORY_MAJOR_FAULT: MetricDesc = counter(
    "libvirt_domain_memory_stats_major_fault_total",
    "Page faults occur when a process makes a valid access to virtual memory that is not available. \
     When servicing the page fault, if disk IO is required, it is considered a major fault.",
    DOMAIN,
);
pub static MEMORY_MINOR_FAULT: MetricDesc = counter(
    "libvirt_domain_memory_stats_minor_fault_total",
    "Page faults occur when a process makes a valid access to virtual memory that is not available. \
     When servicing the page not fault, if disk IO is required, it is considered a minor fault.",
    DOMAIN,
);
pub static MEMORY_UNUSED: MetricDesc = gauge(
    "libvirt_domain_memory_stats_unused_bytes",
    "The amount of memory left completely unused by the system. Memory that is available but used \
     for reclaimable caches should NOT be reported as free. This value is expressed in bytes.",
    DOMAIN,
);
pub static MEMORY_AVAILABLE: MetricDesc = gauge(
    "libvirt_domain_memory_stats_available_bytes",
    "The total amount of usable memory as seen by the domain. This value may be less than the \
     amount of memory assigned to the domain if a balloon driver is in use or if the guest OS \
     does not initialize all assigned pages. This value is expressed in bytes.",
    DOMAIN,
);
pub static MEMORY_ACTUAL_BALLOON: MetricDesc = gauge(
    "libvirt_domain_memory_stats_actual_balloon_bytes",
    "Current balloon value (in bytes).",
    DOMAIN,
);
pub static MEMORY_RSS: MetricDesc = gauge(
    "libvirt_domain_memory_stats_rss_bytes",
    "Resident Set Size of the process running the domain. This value is in bytes",
    DOMAIN,
);
pub static MEMORY_USABLE: MetricDesc = gauge(
    "libvirt_domain_memory_stats_usable_bytes",
    "How much the balloon can be inflated without pushing the guest system to swap, corresponds \
     to 'Available' in /proc/meminfo",
    DOMAIN,
);
pub static MEMORY_DISK_CACHE: MetricDesc = gauge(
    "libvirt_domain_memory_stats_disk_cache_bytes",
    "The amount of memory, that can be quickly reclaimed without additional I/O (in bytes). \
     Typically these pages are used for caching files from disk.",
    DOMAIN,
);
pub static MEMORY_USED_PERCENT: MetricDesc = gauge(
    "libvirt_domain_memory_stats_used_percent",
    "The amount of memory in percent, that used by domain.",
    DOMAIN,
);

/// Every metric family this exporter can produce, in exposition order.
pub static CATALOGUE: &[&MetricDesc] = &[
    &UP,
    &VERSIONS_INFO,
    &POOL_CAPACITY,
    &POOL_ALLOCATION,
    &POOL_AVAILABLE,
    &DOMAIN_INFO_META,
    &DOMAIN_INFO_MAX_MEM,
    &DOMAIN_INFO_MEMORY_USAGE,
    &DOMAIN_INFO_NR_VIRT_CPU,
    &DOMAIN_INFO_CPU_TIME,
    &DOMAIN_INFO_STATE,
    &VCPU_STATE,
    &VCPU_TIME,
    &VCPU_DELAY,
    &VCPU_CPU,
    &VCPU_WAIT,
    &BLOCK_META,
    &BLOCK_READ_BYTES,
    &BLOCK_READ_REQUESTS,
    &BLOCK_READ_TIME,
    &BLOCK_WRITE_BYTES,
    &BLOCK_WRITE_REQUESTS,
    &BLOCK_WRITE_TIME,
    &BLOCK_FLUSH_REQUESTS,
    &BLOCK_FLUSH_TIME,
    &BLOCK_ALLOCATION,
    &BLOCK_CAPACITY,
    &BLOCK_PHYSICAL_SIZE,
    &BLOCK_LIMIT_TOTAL_BYTES,
    &BLOCK_LIMIT_WRITE_BYTES,
    &BLOCK_LIMIT_READ_BYTES,
    &BLOCK_LIMIT_TOTAL_REQUESTS,
    &BLOCK_LIMIT_WRITE_REQUESTS,
    &BLOCK_LIMIT_READ_REQUESTS,
    &BLOCK_LIMIT_BURST_TOTAL_BYTES,
    &BLOCK_LIMIT_BURST_WRITE_BYTES,
    &BLOCK_LIMIT_BURST_READ_BYTES,
    &BLOCK_LIMIT_BURST_TOTAL_REQUESTS,
    &BLOCK_LIMIT_BURST_WRITE_REQUESTS,
    &BLOCK_LIMIT_BURST_READ_REQUESTS,
    &BLOCK_LIMIT_BURST_TOTAL_BYTES_LENGTH,
    &BLOCK_LIMIT_BURST_WRITE_BYTES_LENGTH,
    &BLOCK_LIMIT_BURST_READ_BYTES_LENGTH,
    &BLOCK_LIMIT_BURST_TOTAL_REQUESTS_LENGTH,
    &BLOCK_LIMIT_BURST_WRITE_REQUESTS_LENGTH,
    &BLOCK_LIMIT_BURST_READ_REQUESTS_LENGTH,
    &BLOCK_SIZE_IOPS,
    &INTERFACE_META,
    &INTERFACE_RX_BYTES,
    &INTERFACE_RX_PACKETS,
    &INTERFACE_RX_ERRORS,
    &INTERFACE_RX_DROPS,
    &INTERFACE_TX_BYTES,
    &INTERFACE_TX_PACKETS,
    &INTERFACE_TX_ERRORS,
    &INTERFACE_TX_DROPS,
    &MEMORY_MAJOR_FAULT,
    &MEMORY_MINOR_FAULT,
    &MEMORY_UNUSED,
    &MEMORY_AVAILABLE,
    &MEMORY_ACTUAL_BALLOON,
    &MEMORY_RSS,
    &MEMORY_USABLE,
    &MEMORY_DISK_CACHE,
    &MEMORY_USED_PERCENT,
];

/// One sample produced during a scrape. Scrape-scoped value data: created
/// fresh each collection cycle and discarded after exposition.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub desc: &'static MetricDesc,
    pub value: f64,
    pub label_values: Vec<String>,
}

impl MetricRecord {
    pub fn new(desc: &'static MetricDesc, value: f64, label_values: Vec<String>) -> Self {
        debug_assert_eq!(
            desc.labels.len(),
            label_values.len(),
            "label value count must match the descriptor for {}",
            desc.name
        );
        Self {
            desc,
            value,
            label_values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalogue_names_are_unique() {
        let mut seen = HashSet::new();
        for desc in CATALOGUE {
            assert!(seen.insert(desc.name), "duplicate metric name {}", desc.name);
        }
    }

    #[test]
    fn test_catalogue_names_are_hierarchical() {
        for desc in CATALOGUE {
            assert!(
                desc.name.starts_with("libvirt_"),
                "{} does not carry the libvirt_ prefix",
                desc.name
            );
        }
    }

    #[test]
    fn test_counter_names_follow_convention() {
        for desc in CATALOGUE {
            if desc.kind == MetricKind::Counter {
                assert!(
                    desc.name.ends_with("_total"),
                    "counter {} should end in _total",
                    desc.name
                );
            }
        }
    }

    #[test]
    fn test_every_domain_metric_carries_domain_label() {
        for desc in CATALOGUE {
            if desc.name.starts_with("libvirt_domain_") {
                assert_eq!(desc.labels.first(), Some(&"domain"), "{}", desc.name);
            }
        }
    }
}
