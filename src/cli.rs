//! CLI arguments for libvirt-exporter.
//!
//! This module defines the command-line interface structure using the clap
//! library. The flag names follow the node-exporter convention of
//! `section.option`.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "libvirt-exporter",
    about = "Prometheus exporter for libvirt domain, device and storage pool metrics",
    version,
    propagate_version = true
)]
pub struct Args {
    /// Libvirt connection URI (e.g. qemu:///system, qemu:///session,
    /// xen:///system, test:///default)
    #[arg(long = "libvirt.uri", default_value = "qemu:///system")]
    pub libvirt_uri: String,

    /// Procfs mountpoint
    #[arg(long = "path.procfs", default_value = crate::proctable::DEFAULT_MOUNT_POINT)]
    pub procfs_path: PathBuf,

    /// Address on which to expose metrics
    #[arg(long = "web.listen-address", default_value = "0.0.0.0:9177")]
    pub listen_address: SocketAddr,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    pub telemetry_path: String,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["libvirt-exporter"]);
        assert_eq!(args.libvirt_uri, "qemu:///system");
        assert_eq!(args.procfs_path, PathBuf::from("/proc"));
        assert_eq!(args.telemetry_path, "/metrics");
        assert_eq!(args.listen_address.port(), 9177);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "libvirt-exporter",
            "--libvirt.uri",
            "test:///default",
            "--web.listen-address",
            "127.0.0.1:9999",
            "--web.telemetry-path",
            "/libvirt",
        ]);
        assert_eq!(args.libvirt_uri, "test:///default");
        assert_eq!(args.listen_address.port(), 9999);
        assert_eq!(args.telemetry_path, "/libvirt");
    }
}
