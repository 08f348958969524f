//! Real hypervisor backend built on the libvirt client library.
//!
//! The batched statistics call returns typed-parameter lists keyed by
//! dotted field names (`vcpu.0.delay`, `block.1.rd.bytes`, ...); this module
//! walks them into the structured types the collector consumes. The few
//! calls the safe bindings do not cover (VCPU placement, block I/O limits,
//! the QEMU human monitor) go through a local FFI block against the same
//! native library the bindings already link.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use virt::connect::Connect;
use virt::domain::Domain;
use virt::storage_pool::StoragePool;

use super::{
    format_version, BlockIoTune, BlockStat, Connection, Connector, DomainInfo, DomainRef,
    DomainState, DomainStats, InterfaceStat, MemoryStat, PoolInfo, PoolRef, VcpuInfo, VcpuStat,
    VersionInfo,
};
use crate::error::ScrapeError;

// virDomainStatsTypes
const STATS_STATE: u32 = 0x1;
const STATS_CPU_TOTAL: u32 = 0x2;
const STATS_BALLOON: u32 = 0x4;
const STATS_VCPU: u32 = 0x8;
const STATS_INTERFACE: u32 = 0x10;
const STATS_BLOCK: u32 = 0x20;
const STATS_PERF: u32 = 0x40;

// virConnectGetAllDomainStatsFlags
const LIST_DOMAINS_RUNNING: u32 = 0x10;
const LIST_DOMAINS_SHUTOFF: u32 = 0x40;

// virConnectListAllStoragePoolsFlags
const LIST_POOLS_ACTIVE: u32 = 0x2;

// virErrorNumber values the collector distinguishes.
const VIR_ERR_NO_SUPPORT: i32 = 3;
const VIR_ERR_OPERATION_INVALID: i32 = 55;
const VIR_ERR_ARGUMENT_UNSUPPORTED: i32 = 74;
const VIR_ERR_OPERATION_UNSUPPORTED: i32 = 84;

fn classify(code: i32, message: String) -> ScrapeError {
    match code {
        VIR_ERR_OPERATION_INVALID => ScrapeError::InvalidOperation(message),
        VIR_ERR_NO_SUPPORT | VIR_ERR_ARGUMENT_UNSUPPORTED | VIR_ERR_OPERATION_UNSUPPORTED => {
            ScrapeError::Unsupported(message)
        }
        _ => ScrapeError::Query(message),
    }
}

fn map_virt_err(err: virt::error::Error) -> ScrapeError {
    classify(err.code, err.message)
}

/// Maps the thread-local libvirt error after a failed raw call.
fn last_error() -> ScrapeError {
    unsafe {
        let err = ffi::virGetLastError();
        if err.is_null() {
            return ScrapeError::Query("unknown libvirt error".to_string());
        }
        let message = if (*err).message.is_null() {
            "unknown libvirt error".to_string()
        } else {
            CStr::from_ptr((*err).message).to_string_lossy().into_owned()
        };
        classify((*err).code, message)
    }
}

/// Opens real connections through the libvirt client library.
pub struct LibvirtConnector;

impl Connector for LibvirtConnector {
    fn connect(&self, uri: &str) -> Result<Box<dyn Connection>, ScrapeError> {
        let conn = Connect::open(uri).map_err(|e| ScrapeError::Connection {
            uri: uri.to_string(),
            reason: e.message,
        })?;
        Ok(Box::new(LibvirtConnection { conn }))
    }
}

struct LibvirtConnection {
    conn: Connect,
}

impl Drop for LibvirtConnection {
    fn drop(&mut self) {
        let _ = self.conn.close();
    }
}

impl Connection for LibvirtConnection {
    fn versions(&self) -> Result<VersionInfo, ScrapeError> {
        let hypervisor = self.conn.get_hyp_version().map_err(map_virt_err)?;
        let daemon = self.conn.get_lib_version().map_err(map_virt_err)?;
        let library = Connect::get_version().map_err(map_virt_err)?;
        Ok(VersionInfo {
            hypervisor: format_version(u64::from(hypervisor)),
            daemon: format_version(u64::from(daemon)),
            library: format_version(u64::from(library)),
        })
    }

    fn all_domain_stats(&self) -> Result<Vec<DomainStats>, ScrapeError> {
        let records = self
            .conn
            .get_all_domain_stats(
                STATS_STATE
                    | STATS_CPU_TOTAL
                    | STATS_BALLOON
                    | STATS_VCPU
                    | STATS_INTERFACE
                    | STATS_BLOCK
                    | STATS_PERF,
                LIST_DOMAINS_RUNNING | LIST_DOMAINS_SHUTOFF,
            )
            .map_err(map_virt_err)?;

        let mut stats = Vec::with_capacity(records.len());
        for record in &records {
            // The record list owns its domain references; take one of our
            // own so the handle outlives the list.
            let raw = unsafe { (*record.ptr).dom };
            unsafe { ffi::virDomainRef(raw as *mut c_void) };
            let domain = unsafe { Domain::new(raw) };

            let params = unsafe { read_params((*record.ptr).params as *const ffi::TypedParam, (*record.ptr).nparams) };
            stats.push(DomainStats {
                domain: Box::new(LibvirtDomain {
                    raw: raw as *mut c_void,
                    domain,
                }),
                vcpus: parse_vcpus(&params),
                blocks: parse_blocks(&params),
                interfaces: parse_interfaces(&params),
            });
        }
        Ok(stats)
    }

    fn active_pools(&self) -> Result<Vec<Box<dyn PoolRef>>, ScrapeError> {
        let pools = self
            .conn
            .list_all_storage_pools(LIST_POOLS_ACTIVE)
            .map_err(map_virt_err)?;
        Ok(pools
            .into_iter()
            .map(|pool| Box::new(LibvirtPool { pool }) as Box<dyn PoolRef>)
            .collect())
    }
}

struct LibvirtDomain {
    raw: *mut c_void,
    domain: Domain,
}

impl Drop for LibvirtDomain {
    fn drop(&mut self) {
        let _ = self.domain.free();
    }
}

impl DomainRef for LibvirtDomain {
    fn name(&self) -> Result<String, ScrapeError> {
        self.domain.get_name().map_err(map_virt_err)
    }

    fn uuid(&self) -> Result<String, ScrapeError> {
        self.domain.get_uuid_string().map_err(map_virt_err)
    }

    fn xml_desc(&self) -> Result<String, ScrapeError> {
        self.domain.get_xml_desc(0).map_err(map_virt_err)
    }

    fn info(&self) -> Result<DomainInfo, ScrapeError> {
        let info = self.domain.get_info().map_err(map_virt_err)?;
        Ok(DomainInfo {
            state: DomainState::from(info.state),
            max_mem_kib: info.max_mem,
            memory_kib: info.memory,
            nr_virt_cpu: info.nr_virt_cpu,
            cpu_time_ns: info.cpu_time,
        })
    }

    fn vcpu_info(&self) -> Result<Vec<VcpuInfo>, ScrapeError> {
        let max = self.domain.get_info().map_err(map_virt_err)?.nr_virt_cpu;
        let mut raw_info = vec![
            ffi::VcpuInfoRaw {
                number: 0,
                state: 0,
                cpu_time: 0,
                cpu: 0,
            };
            max as usize
        ];
        let count = unsafe {
            ffi::virDomainGetVcpus(
                self.raw,
                raw_info.as_mut_ptr(),
                max as c_int,
                ptr::null_mut(),
                0,
            )
        };
        if count < 0 {
            return Err(last_error());
        }
        raw_info.truncate(count as usize);
        Ok(raw_info
            .into_iter()
            .map(|v| VcpuInfo {
                number: v.number,
                state: v.state,
                cpu_time_ns: v.cpu_time,
                cpu: v.cpu,
            })
            .collect())
    }

    fn monitor_command(&self, cmd: &str) -> Result<String, ScrapeError> {
        let cmd = CString::new(cmd)
            .map_err(|_| ScrapeError::Parse("monitor command contains NUL".to_string()))?;
        let mut result: *mut c_char = ptr::null_mut();
        let ret = unsafe {
            ffi::virDomainQemuMonitorCommand(
                self.raw,
                cmd.as_ptr(),
                &mut result,
                ffi::VIR_DOMAIN_QEMU_MONITOR_COMMAND_HMP,
            )
        };
        if ret < 0 {
            return Err(last_error());
        }
        let output = unsafe {
            let s = CStr::from_ptr(result).to_string_lossy().into_owned();
            ffi::free(result as *mut c_void);
            s
        };
        Ok(output)
    }

    fn block_iotune(&self, device: &str) -> Result<BlockIoTune, ScrapeError> {
        let device = CString::new(device)
            .map_err(|_| ScrapeError::Parse("device name contains NUL".to_string()))?;

        let mut nparams: c_int = 0;
        let ret = unsafe {
            ffi::virDomainGetBlockIoTune(self.raw, device.as_ptr(), ptr::null_mut(), &mut nparams, 0)
        };
        if ret < 0 {
            return Err(last_error());
        }
        if nparams == 0 {
            return Ok(BlockIoTune::default());
        }

        let mut raw_params = vec![ffi::TypedParam::zeroed(); nparams as usize];
        let ret = unsafe {
            ffi::virDomainGetBlockIoTune(
                self.raw,
                device.as_ptr(),
                raw_params.as_mut_ptr(),
                &mut nparams,
                0,
            )
        };
        if ret < 0 {
            return Err(last_error());
        }

        let params = unsafe { read_params(raw_params.as_ptr(), nparams) };
        let get = |name: &str| params.get(name).and_then(ParamValue::as_u64);
        Ok(BlockIoTune {
            total_bytes_sec: get("total_bytes_sec"),
            read_bytes_sec: get("read_bytes_sec"),
            write_bytes_sec: get("write_bytes_sec"),
            total_iops_sec: get("total_iops_sec"),
            read_iops_sec: get("read_iops_sec"),
            write_iops_sec: get("write_iops_sec"),
            total_bytes_sec_max: get("total_bytes_sec_max"),
            read_bytes_sec_max: get("read_bytes_sec_max"),
            write_bytes_sec_max: get("write_bytes_sec_max"),
            total_iops_sec_max: get("total_iops_sec_max"),
            read_iops_sec_max: get("read_iops_sec_max"),
            write_iops_sec_max: get("write_iops_sec_max"),
            total_bytes_sec_max_length: get("total_bytes_sec_max_length"),
            read_bytes_sec_max_length: get("read_bytes_sec_max_length"),
            write_bytes_sec_max_length: get("write_bytes_sec_max_length"),
            total_iops_sec_max_length: get("total_iops_sec_max_length"),
            read_iops_sec_max_length: get("read_iops_sec_max_length"),
            write_iops_sec_max_length: get("write_iops_sec_max_length"),
            size_iops_sec: get("size_iops_sec"),
        })
    }

    fn memory_stats(&self) -> Result<Vec<MemoryStat>, ScrapeError> {
        let stats = self.domain.memory_stats(0).map_err(map_virt_err)?;
        Ok(stats
            .iter()
            .map(|s| MemoryStat {
                tag: s.tag,
                value_kib: s.val,
            })
            .collect())
    }
}

struct LibvirtPool {
    pool: StoragePool,
}

impl PoolRef for LibvirtPool {
    fn refresh(&self) -> Result<(), ScrapeError> {
        self.pool.refresh(0).map_err(map_virt_err)
    }

    fn name(&self) -> Result<String, ScrapeError> {
        self.pool.get_name().map_err(map_virt_err)
    }

    fn info(&self) -> Result<PoolInfo, ScrapeError> {
        let info = self.pool.get_info().map_err(map_virt_err)?;
        Ok(PoolInfo {
            capacity_bytes: info.capacity,
            allocation_bytes: info.allocation,
            available_bytes: info.available,
        })
    }
}

/// Typed-parameter value, narrowed to what the statistics batch carries.
#[derive(Debug, Clone)]
enum ParamValue {
    Unsigned(u64),
    Signed(i64),
    Text(String),
}

impl ParamValue {
    fn as_u64(&self) -> Option<u64> {
        match self {
            ParamValue::Unsigned(v) => Some(*v),
            ParamValue::Signed(v) => u64::try_from(*v).ok(),
            ParamValue::Text(_) => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Reads a raw typed-parameter array into an owned name/value map.
unsafe fn read_params(params: *const ffi::TypedParam, nparams: c_int) -> HashMap<String, ParamValue> {
    let mut out = HashMap::new();
    if params.is_null() {
        return out;
    }
    for i in 0..nparams as isize {
        let param = &*params.offset(i);
        let name = CStr::from_ptr(param.field.as_ptr()).to_string_lossy().into_owned();
        let value = match param.typ {
            ffi::VIR_TYPED_PARAM_INT => ParamValue::Signed(i64::from(param.value.i)),
            ffi::VIR_TYPED_PARAM_UINT => ParamValue::Unsigned(u64::from(param.value.ui)),
            ffi::VIR_TYPED_PARAM_LLONG => ParamValue::Signed(param.value.l),
            ffi::VIR_TYPED_PARAM_ULLONG => ParamValue::Unsigned(param.value.ul),
            ffi::VIR_TYPED_PARAM_BOOLEAN => ParamValue::Unsigned(u64::from(param.value.b as u8)),
            ffi::VIR_TYPED_PARAM_STRING => {
                if param.value.s.is_null() {
                    continue;
                }
                ParamValue::Text(CStr::from_ptr(param.value.s).to_string_lossy().into_owned())
            }
            _ => continue,
        };
        out.insert(name, value);
    }
    out
}

fn indexed_u64(params: &HashMap<String, ParamValue>, prefix: &str, i: usize, suffix: &str) -> Option<u64> {
    params
        .get(&format!("{prefix}.{i}.{suffix}"))
        .and_then(ParamValue::as_u64)
}

fn indexed_text(
    params: &HashMap<String, ParamValue>,
    prefix: &str,
    i: usize,
    suffix: &str,
) -> Option<String> {
    params
        .get(&format!("{prefix}.{i}.{suffix}"))
        .and_then(ParamValue::as_text)
        .map(str::to_owned)
}

/// The batch reports `vcpu.maximum` entries; slots beyond `vcpu.current`
/// typically carry no wait/delay values.
fn parse_vcpus(params: &HashMap<String, ParamValue>) -> Vec<VcpuStat> {
    let max = params
        .get("vcpu.maximum")
        .and_then(ParamValue::as_u64)
        .unwrap_or(0) as usize;
    (0..max)
        .map(|i| VcpuStat {
            wait_ns: indexed_u64(params, "vcpu", i, "wait"),
            delay_ns: indexed_u64(params, "vcpu", i, "delay"),
        })
        .collect()
}

fn parse_blocks(params: &HashMap<String, ParamValue>) -> Vec<BlockStat> {
    let count = params
        .get("block.count")
        .and_then(ParamValue::as_u64)
        .unwrap_or(0) as usize;
    (0..count)
        .map(|i| BlockStat {
            name: indexed_text(params, "block", i, "name").unwrap_or_default(),
            path: indexed_text(params, "block", i, "path"),
            rd_bytes: indexed_u64(params, "block", i, "rd.bytes"),
            rd_requests: indexed_u64(params, "block", i, "rd.reqs"),
            rd_time_ns: indexed_u64(params, "block", i, "rd.times"),
            wr_bytes: indexed_u64(params, "block", i, "wr.bytes"),
            wr_requests: indexed_u64(params, "block", i, "wr.reqs"),
            wr_time_ns: indexed_u64(params, "block", i, "wr.times"),
            flush_requests: indexed_u64(params, "block", i, "fl.reqs"),
            flush_time_ns: indexed_u64(params, "block", i, "fl.times"),
            allocation: indexed_u64(params, "block", i, "allocation"),
            capacity: indexed_u64(params, "block", i, "capacity"),
            physical: indexed_u64(params, "block", i, "physical"),
        })
        .collect()
}

fn parse_interfaces(params: &HashMap<String, ParamValue>) -> Vec<InterfaceStat> {
    let count = params
        .get("net.count")
        .and_then(ParamValue::as_u64)
        .unwrap_or(0) as usize;
    (0..count)
        .map(|i| InterfaceStat {
            name: indexed_text(params, "net", i, "name").unwrap_or_default(),
            rx_bytes: indexed_u64(params, "net", i, "rx.bytes"),
            rx_packets: indexed_u64(params, "net", i, "rx.pkts"),
            rx_errors: indexed_u64(params, "net", i, "rx.errs"),
            rx_drops: indexed_u64(params, "net", i, "rx.drop"),
            tx_bytes: indexed_u64(params, "net", i, "tx.bytes"),
            tx_packets: indexed_u64(params, "net", i, "tx.pkts"),
            tx_errors: indexed_u64(params, "net", i, "tx.errs"),
            tx_drops: indexed_u64(params, "net", i, "tx.drop"),
        })
        .collect()
}

#[allow(non_camel_case_types, non_snake_case)]
mod ffi {
    use std::os::raw::{c_char, c_int, c_uint, c_ulonglong, c_void};

    pub const VIR_TYPED_PARAM_INT: c_int = 1;
    pub const VIR_TYPED_PARAM_UINT: c_int = 2;
    pub const VIR_TYPED_PARAM_LLONG: c_int = 3;
    pub const VIR_TYPED_PARAM_ULLONG: c_int = 4;
    pub const VIR_TYPED_PARAM_BOOLEAN: c_int = 6;
    pub const VIR_TYPED_PARAM_STRING: c_int = 7;

    pub const VIR_DOMAIN_QEMU_MONITOR_COMMAND_HMP: c_uint = 1;

    const VIR_TYPED_PARAM_FIELD_LENGTH: usize = 80;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub union TypedParamValue {
        pub i: c_int,
        pub ui: c_uint,
        pub l: i64,
        pub ul: u64,
        pub d: f64,
        pub b: c_char,
        pub s: *mut c_char,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct TypedParam {
        pub field: [c_char; VIR_TYPED_PARAM_FIELD_LENGTH],
        pub typ: c_int,
        pub value: TypedParamValue,
    }

    impl TypedParam {
        pub fn zeroed() -> Self {
            unsafe { std::mem::zeroed() }
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct VcpuInfoRaw {
        pub number: c_uint,
        pub state: c_int,
        pub cpu_time: c_ulonglong,
        pub cpu: c_int,
    }

    #[repr(C)]
    pub struct VirError {
        pub code: c_int,
        pub domain: c_int,
        pub message: *mut c_char,
        // Remaining fields are not read.
        _rest: [u8; 0],
    }

    extern "C" {
        pub fn virGetLastError() -> *mut VirError;
        pub fn virDomainRef(domain: *mut c_void) -> c_int;
        pub fn virDomainGetVcpus(
            domain: *mut c_void,
            info: *mut VcpuInfoRaw,
            maxinfo: c_int,
            cpumaps: *mut u8,
            maplen: c_int,
        ) -> c_int;
        pub fn virDomainGetBlockIoTune(
            domain: *mut c_void,
            disk: *const c_char,
            params: *mut TypedParam,
            nparams: *mut c_int,
            flags: c_uint,
        ) -> c_int;
        pub fn free(ptr: *mut c_void);
    }

    #[link(name = "virt-qemu")]
    extern "C" {
        pub fn virDomainQemuMonitorCommand(
            domain: *mut c_void,
            cmd: *const c_char,
            result: *mut *mut c_char,
            flags: c_uint,
        ) -> c_int;
    }
}
