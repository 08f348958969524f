//! Hypervisor access seam and raw statistics data model.
//!
//! The collector talks to the virtualization daemon through the traits in
//! this module so the mapping logic can be driven by an in-memory fake in
//! tests. The real backend lives in [`libvirt`] behind the `libvirt` cargo
//! feature, since it links the native client library.
//!
//! Counters that the hypervisor reports conditionally (depending on version,
//! driver and domain state) are modelled as `Option` fields: `None` means the
//! field was absent from the response and no metric series is emitted for it.

#[cfg(feature = "libvirt")]
pub mod libvirt;

use crate::error::ScrapeError;

/// Versions of the virtualization components, already formatted for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Hypervisor running on the host (e.g. QEMU).
    pub hypervisor: String,
    /// libvirt daemon running on the host.
    pub daemon: String,
    /// libvirt library linked into this process.
    pub library: String,
}

/// Formats a decimal-encoded libvirt version number (major * 1_000_000 +
/// minor * 1_000 + release) as `major.minor.release`.
pub fn format_version(num: u64) -> String {
    format!(
        "{}.{}.{}",
        num / 1_000_000 % 1000,
        num / 1000 % 1000,
        num % 1000
    )
}

/// Lifecycle state of a domain, as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DomainState {
    NoState = 0,
    Running = 1,
    Blocked = 2,
    Paused = 3,
    ShuttingDown = 4,
    ShutOff = 5,
    Crashed = 6,
    Suspended = 7,
}

impl From<u32> for DomainState {
    fn from(value: u32) -> Self {
        match value {
            1 => DomainState::Running,
            2 => DomainState::Blocked,
            3 => DomainState::Paused,
            4 => DomainState::ShuttingDown,
            5 => DomainState::ShutOff,
            6 => DomainState::Crashed,
            7 => DomainState::Suspended,
            _ => DomainState::NoState,
        }
    }
}

/// Domain resource totals from the hypervisor's info call.
#[derive(Debug, Clone, Copy)]
pub struct DomainInfo {
    pub state: DomainState,
    /// Maximum allowed memory, in kibibytes.
    pub max_mem_kib: u64,
    /// Current memory, in kibibytes.
    pub memory_kib: u64,
    pub nr_virt_cpu: u32,
    /// Cumulative CPU time, in nanoseconds.
    pub cpu_time_ns: u64,
}

/// Per-VCPU slice of the batched domain statistics. The batch covers the
/// configured maximum VCPU count; entries beyond the active count typically
/// carry no values.
#[derive(Debug, Clone, Copy, Default)]
pub struct VcpuStat {
    /// Time runnable but waiting, from the hypervisor (CONFIG_SCHEDSTATS).
    pub wait_ns: Option<u64>,
    /// Scheduling delay as reported by the hypervisor, if it supports it.
    pub delay_ns: Option<u64>,
}

/// One VCPU from the hypervisor's VCPU-info call.
#[derive(Debug, Clone, Copy)]
pub struct VcpuInfo {
    pub number: u32,
    /// 0: offline, 1: running, 2: blocked.
    pub state: i32,
    pub cpu_time_ns: u64,
    /// Real CPU number, or a virVcpuHostCpuState value.
    pub cpu: i32,
}

/// Per-block-device slice of the batched domain statistics.
#[derive(Debug, Clone, Default)]
pub struct BlockStat {
    pub name: String,
    /// Source of the block device if it is a file or block device; omitted
    /// for network sources and drives with no media inserted.
    pub path: Option<String>,
    pub rd_bytes: Option<u64>,
    pub rd_requests: Option<u64>,
    pub rd_time_ns: Option<u64>,
    pub wr_bytes: Option<u64>,
    pub wr_requests: Option<u64>,
    pub wr_time_ns: Option<u64>,
    pub flush_requests: Option<u64>,
    pub flush_time_ns: Option<u64>,
    pub allocation: Option<u64>,
    pub capacity: Option<u64>,
    pub physical: Option<u64>,
}

/// Block device I/O throttling limits. Every field is independently optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockIoTune {
    pub total_bytes_sec: Option<u64>,
    pub read_bytes_sec: Option<u64>,
    pub write_bytes_sec: Option<u64>,
    pub total_iops_sec: Option<u64>,
    pub read_iops_sec: Option<u64>,
    pub write_iops_sec: Option<u64>,
    pub total_bytes_sec_max: Option<u64>,
    pub read_bytes_sec_max: Option<u64>,
    pub write_bytes_sec_max: Option<u64>,
    pub total_iops_sec_max: Option<u64>,
    pub read_iops_sec_max: Option<u64>,
    pub write_iops_sec_max: Option<u64>,
    pub total_bytes_sec_max_length: Option<u64>,
    pub read_bytes_sec_max_length: Option<u64>,
    pub write_bytes_sec_max_length: Option<u64>,
    pub total_iops_sec_max_length: Option<u64>,
    pub read_iops_sec_max_length: Option<u64>,
    pub write_iops_sec_max_length: Option<u64>,
    pub size_iops_sec: Option<u64>,
}

/// Per-network-interface slice of the batched domain statistics.
#[derive(Debug, Clone, Default)]
pub struct InterfaceStat {
    pub name: String,
    pub rx_bytes: Option<u64>,
    pub rx_packets: Option<u64>,
    pub rx_errors: Option<u64>,
    pub rx_drops: Option<u64>,
    pub tx_bytes: Option<u64>,
    pub tx_packets: Option<u64>,
    pub tx_errors: Option<u64>,
    pub tx_drops: Option<u64>,
}

// Tags of virDomainMemoryStats entries the exporter consumes.
pub const MEM_STAT_MAJOR_FAULT: i32 = 2;
pub const MEM_STAT_MINOR_FAULT: i32 = 3;
pub const MEM_STAT_UNUSED: i32 = 4;
pub const MEM_STAT_AVAILABLE: i32 = 5;
pub const MEM_STAT_ACTUAL_BALLOON: i32 = 6;
pub const MEM_STAT_RSS: i32 = 7;
pub const MEM_STAT_USABLE: i32 = 8;
pub const MEM_STAT_DISK_CACHES: i32 = 10;

/// One tagged memory statistic, kibibyte-scaled at the source.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStat {
    pub tag: i32,
    pub value_kib: u64,
}

/// Storage pool resource totals.
#[derive(Debug, Clone, Copy)]
pub struct PoolInfo {
    pub capacity_bytes: u64,
    pub allocation_bytes: u64,
    pub available_bytes: u64,
}

/// One domain's entry in the batched statistics snapshot: the raw per-VCPU,
/// per-block and per-interface counters plus a live handle for the follow-up
/// per-domain queries. The handle owns its host-side resources and releases
/// them on drop, on every exit path.
pub struct DomainStats {
    pub domain: Box<dyn DomainRef>,
    pub vcpus: Vec<VcpuStat>,
    pub blocks: Vec<BlockStat>,
    pub interfaces: Vec<InterfaceStat>,
}

/// Live handle to one domain.
pub trait DomainRef {
    fn name(&self) -> Result<String, ScrapeError>;
    fn uuid(&self) -> Result<String, ScrapeError>;
    /// Structured XML description of the domain's devices and metadata.
    fn xml_desc(&self) -> Result<String, ScrapeError>;
    fn info(&self) -> Result<DomainInfo, ScrapeError>;
    fn vcpu_info(&self) -> Result<Vec<VcpuInfo>, ScrapeError>;
    /// Issues a human-monitor command and returns its textual response.
    fn monitor_command(&self, cmd: &str) -> Result<String, ScrapeError>;
    fn block_iotune(&self, device: &str) -> Result<BlockIoTune, ScrapeError>;
    fn memory_stats(&self) -> Result<Vec<MemoryStat>, ScrapeError>;
}

/// Live handle to one storage pool.
pub trait PoolRef {
    fn refresh(&self) -> Result<(), ScrapeError>;
    fn name(&self) -> Result<String, ScrapeError>;
    fn info(&self) -> Result<PoolInfo, ScrapeError>;
}

/// One open connection to the virtualization daemon. Connections live for a
/// single scrape; the underlying handle is closed on drop.
pub trait Connection {
    fn versions(&self) -> Result<VersionInfo, ScrapeError>;
    /// Aggregated statistics for all domains in running or shut-off state,
    /// fetched in one batched call.
    fn all_domain_stats(&self) -> Result<Vec<DomainStats>, ScrapeError>;
    fn active_pools(&self) -> Result<Vec<Box<dyn PoolRef>>, ScrapeError>;
}

/// Opens connections to a virtualization daemon.
pub trait Connector {
    fn connect(&self, uri: &str) -> Result<Box<dyn Connection>, ScrapeError>;
}

/// Placeholder backend used when the crate is built without the `libvirt`
/// feature; every connection attempt fails, so the exporter reports `up` 0.
pub struct UnavailableConnector;

impl Connector for UnavailableConnector {
    fn connect(&self, uri: &str) -> Result<Box<dyn Connection>, ScrapeError> {
        Err(ScrapeError::Connection {
            uri: uri.to_string(),
            reason: "built without the `libvirt` feature".to_string(),
        })
    }
}
