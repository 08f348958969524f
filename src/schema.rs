//! Typed view of the domain XML description.
//!
//! Decodes the hypervisor's XML device/metadata document into lookups keyed
//! by target device name. Every field defaults to empty so that a device
//! present in the statistics batch but absent from the description degrades
//! to empty metadata labels instead of aborting collection.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::ScrapeError;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct DiskSource {
    #[serde(default)]
    pub file: String,
    /// Source name for network-backed disks (e.g. rbd volumes).
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct DiskTarget {
    #[serde(default)]
    pub dev: String,
    #[serde(default)]
    pub bus: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct DiskDriver {
    #[serde(default, rename = "type")]
    pub driver_type: String,
    #[serde(default)]
    pub cache: String,
    #[serde(default)]
    pub discard: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Disk {
    #[serde(default, rename = "type")]
    pub disk_type: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub source: DiskSource,
    #[serde(default)]
    pub target: DiskTarget,
    #[serde(default)]
    pub driver: DiskDriver,
    #[serde(default)]
    pub serial: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct InterfaceSource {
    #[serde(default)]
    pub bridge: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct InterfaceTarget {
    #[serde(default)]
    pub dev: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct VirtualPortParameters {
    #[serde(default, rename = "interfaceid")]
    pub interface_id: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct VirtualPort {
    #[serde(default)]
    pub parameters: VirtualPortParameters,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Interface {
    #[serde(default)]
    pub source: InterfaceSource,
    #[serde(default)]
    pub target: InterfaceTarget,
    #[serde(default, rename = "virtualport")]
    pub virtual_port: VirtualPort,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Devices {
    #[serde(default, rename = "disk")]
    pub disks: Vec<Disk>,
    #[serde(default, rename = "interface")]
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct NovaUser {
    #[serde(default)]
    pub uuid: String,
    #[serde(default, rename = "$value")]
    pub name: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct NovaProject {
    #[serde(default)]
    pub uuid: String,
    #[serde(default, rename = "$value")]
    pub name: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct NovaOwner {
    #[serde(default)]
    pub user: NovaUser,
    #[serde(default)]
    pub project: NovaProject,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct NovaFlavor {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct NovaRoot {
    #[serde(default, rename = "type")]
    pub root_type: String,
    #[serde(default)]
    pub uuid: String,
}

/// Ownership metadata attached by the compute layer, if any.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct NovaInstance {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub flavor: NovaFlavor,
    #[serde(default)]
    pub owner: NovaOwner,
    #[serde(default)]
    pub root: NovaRoot,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub instance: NovaInstance,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct DomainXml {
    #[serde(default)]
    devices: Devices,
    #[serde(default)]
    metadata: Metadata,
}

/// Decoded domain description with name-keyed device lookups.
#[derive(Debug, Default, Clone)]
pub struct DomainDescriptor {
    disks: HashMap<String, Disk>,
    interfaces: HashMap<String, Interface>,
    pub instance: NovaInstance,
}

impl DomainDescriptor {
    /// Decodes the XML description. Fails only on malformed XML; missing
    /// elements decode to their defaults.
    pub fn decode(xml: &str) -> Result<Self, ScrapeError> {
        let doc: DomainXml = serde_xml_rs::from_str(xml)
            .map_err(|e| ScrapeError::Parse(format!("domain description: {e}")))?;

        let disks = doc
            .devices
            .disks
            .into_iter()
            .map(|d| (d.target.dev.clone(), d))
            .collect();
        let interfaces = doc
            .devices
            .interfaces
            .into_iter()
            .map(|i| (i.target.dev.clone(), i))
            .collect();

        Ok(Self {
            disks,
            interfaces,
            instance: doc.metadata.instance,
        })
    }

    /// Disk attributes for a target device name; empty record if unmatched.
    pub fn disk(&self, target: &str) -> Disk {
        self.disks.get(target).cloned().unwrap_or_default()
    }

    /// Interface attributes for a target device name; empty record if
    /// unmatched.
    pub fn interface(&self, target: &str) -> Interface {
        self.interfaces.get(target).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<domain type="kvm">
  <name>instance-00000042</name>
  <metadata>
    <nova:instance xmlns:nova="http://openstack.org/xmlns/libvirt/nova/1.0">
      <nova:name>web-1</nova:name>
      <nova:flavor name="m1.small"/>
      <nova:owner>
        <nova:user uuid="11111111-2222-3333-4444-555555555555">alice</nova:user>
        <nova:project uuid="66666666-7777-8888-9999-000000000000">web</nova:project>
      </nova:owner>
      <nova:root type="image" uuid="aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee"/>
    </nova:instance>
  </metadata>
  <devices>
    <disk type="file" device="disk">
      <driver name="qemu" type="qcow2" cache="none" discard="unmap"/>
      <source file="/var/lib/libvirt/images/vm.qcow2"/>
      <target dev="vda" bus="virtio"/>
      <serial>SER-001</serial>
    </disk>
    <disk type="network" device="disk">
      <driver name="qemu" type="raw"/>
      <source name="volumes/vm-root" protocol="rbd"/>
      <target dev="vdb" bus="virtio"/>
    </disk>
    <interface type="bridge">
      <source bridge="br-int"/>
      <target dev="vnet0"/>
      <virtualport type="openvswitch">
        <parameters interfaceid="0f66b1d0-1111-2222-3333-444455556666"/>
      </virtualport>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn test_decode_disks_by_target_name() {
        let desc = DomainDescriptor::decode(SAMPLE).unwrap();

        let vda = desc.disk("vda");
        assert_eq!(vda.disk_type, "file");
        assert_eq!(vda.target.bus, "virtio");
        assert_eq!(vda.driver.driver_type, "qcow2");
        assert_eq!(vda.driver.cache, "none");
        assert_eq!(vda.driver.discard, "unmap");
        assert_eq!(vda.serial, "SER-001");
        assert_eq!(vda.source.file, "/var/lib/libvirt/images/vm.qcow2");

        let vdb = desc.disk("vdb");
        assert_eq!(vdb.source.name, "volumes/vm-root");
        assert_eq!(vdb.serial, "");
    }

    #[test]
    fn test_decode_interface_and_virtualport() {
        let desc = DomainDescriptor::decode(SAMPLE).unwrap();
        let vnet0 = desc.interface("vnet0");
        assert_eq!(vnet0.source.bridge, "br-int");
        assert_eq!(
            vnet0.virtual_port.parameters.interface_id,
            "0f66b1d0-1111-2222-3333-444455556666"
        );
    }

    #[test]
    fn test_decode_ownership_metadata() {
        let desc = DomainDescriptor::decode(SAMPLE).unwrap();
        assert_eq!(desc.instance.name, "web-1");
        assert_eq!(desc.instance.flavor.name, "m1.small");
        assert_eq!(desc.instance.owner.user.name, "alice");
        assert_eq!(
            desc.instance.owner.user.uuid,
            "11111111-2222-3333-4444-555555555555"
        );
        assert_eq!(desc.instance.owner.project.name, "web");
        assert_eq!(desc.instance.root.root_type, "image");
    }

    #[test]
    fn test_unmatched_lookup_yields_empty_record() {
        let desc = DomainDescriptor::decode(SAMPLE).unwrap();
        let missing = desc.disk("sdz");
        assert_eq!(missing.serial, "");
        assert_eq!(missing.target.bus, "");
        let missing = desc.interface("vnet9");
        assert_eq!(missing.source.bridge, "");
    }

    #[test]
    fn test_descriptor_without_metadata_decodes_to_defaults() {
        let xml = r#"<domain type="kvm"><devices>
            <disk type="file"><target dev="vda" bus="virtio"/></disk>
        </devices></domain>"#;
        let desc = DomainDescriptor::decode(xml).unwrap();
        assert_eq!(desc.instance.name, "");
        assert_eq!(desc.disk("vda").target.bus, "virtio");
    }

    #[test]
    fn test_malformed_description_is_a_parse_error() {
        let err = DomainDescriptor::decode("<domain><devices>").unwrap_err();
        assert!(matches!(err, ScrapeError::Parse(_)));
        assert!(err.is_tolerated());
    }
}
