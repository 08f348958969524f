//! Prometheus exporter for libvirt-managed virtual machines.
//!
//! One collection cycle opens a connection to the virtualization daemon,
//! fetches a batched statistics snapshot for all running and shut-off
//! domains, enriches it with per-domain queries (XML description, block I/O
//! limits, memory statistics), correlates domains with their host processes
//! through procfs, and maps everything onto a fixed metric catalogue.

pub mod cli;
pub mod collector;
pub mod error;
pub mod exposition;
pub mod hypervisor;
pub mod metrics;
pub mod proctable;
pub mod resolver;
pub mod schema;

pub use collector::{Exporter, ScrapeOutput};
pub use error::ScrapeError;
pub use metrics::{MetricDesc, MetricKind, MetricRecord};
