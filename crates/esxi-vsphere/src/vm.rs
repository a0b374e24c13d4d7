//! VM lifecycle via vSphere.
//!
//! Listing prefers the REST API; every mutation is a vim25 `*_Task` method
//! so its completion can be awaited uniformly by the task waiter.

use crate::error::{VsphereError, VsphereResult};
use crate::soap::SoapClient;
use crate::types::*;
use crate::vsphere::VsphereClient;
use crate::xml::{el, esc, moref};

/// Temporary device keys; vSphere assigns real ones on creation.
const SCSI_CONTROLLER_KEY: i32 = -101;
const DISK_KEY: i32 = -102;
const NIC_KEY: i32 = -103;

/// How a new NIC attaches to its network.
#[derive(Debug, Clone, PartialEq)]
pub enum NicBacking {
    /// Standard port group: backing by network reference and name.
    Standard { network: ObjectRef, name: String },
    /// Distributed port group: backing by switch UUID and port-group key.
    Distributed { name: String, switch_uuid: String, portgroup_key: String },
}

impl NicBacking {
    fn name(&self) -> &str {
        match self {
            Self::Standard { name, .. } | Self::Distributed { name, .. } => name,
        }
    }
}

/// High-level VM operations backed by the SOAP and (optional) REST clients.
pub struct VmManager<'a> {
    soap: &'a SoapClient,
    rest: Option<&'a VsphereClient>,
}

impl<'a> VmManager<'a> {
    pub fn new(soap: &'a SoapClient, rest: Option<&'a VsphereClient>) -> Self {
        Self { soap, rest }
    }

    // ── List / Get ──────────────────────────────────────────────────

    /// List VMs, optionally filtered by exact name.
    pub async fn list_vms_named(&self, names: Option<&[&str]>) -> VsphereResult<Vec<VmSummary>> {
        if let Some(rest) = self.rest {
            return rest.list("/api/vcenter/vm", names.unwrap_or_default()).await;
        }

        let found = self
            .soap
            .retrieve_kind(
                "VirtualMachine",
                &["name", "runtime.powerState", "config.hardware.numCPU", "config.hardware.memoryMB"],
            )
            .await?;
        Ok(found
            .iter()
            .filter_map(vm_summary_from_props)
            .filter(|vm| names.map_or(true, |ns| ns.contains(&vm.name.as_str())))
            .collect())
    }

    pub async fn list_vms(&self) -> VsphereResult<Vec<VmSummary>> {
        self.list_vms_named(None).await
    }

    // ── Create / Clone / Delete ─────────────────────────────────────

    /// `Folder.CreateVM_Task` with a ParaVirtual SCSI controller, one disk
    /// and an optional VMXNET3 NIC.
    pub async fn create_vm(&self, spec: &VmCreateSpec) -> VsphereResult<TaskRef> {
        let nic = match &spec.placement.network {
            Some(net) => Some(self.nic_backing(net).await?),
            None => None,
        };
        let args = format!(
            "<config>{}</config>{}",
            config_spec_xml(spec, nic.as_ref())?,
            moref("pool", &spec.placement.resource_pool)
        );
        log::info!("Creating VM '{}' in {}", spec.name, spec.placement.folder.value);
        self.soap.invoke_task("CreateVM_Task", &spec.placement.folder, &args).await
    }

    /// `VirtualMachine.CloneVM_Task`.
    pub async fn clone_vm(&self, spec: &VmCloneSpec) -> VsphereResult<TaskRef> {
        log::info!("Cloning '{}' to '{}'", spec.source.label(), spec.name);
        self.soap
            .invoke_task("CloneVM_Task", &spec.source, &clone_args_xml(spec))
            .await
    }

    pub async fn destroy_vm(&self, vm: &ObjectRef) -> VsphereResult<TaskRef> {
        log::info!("Deleting VM {}", vm.label());
        self.soap.invoke_task("Destroy_Task", vm, "").await
    }

    // ── Power ───────────────────────────────────────────────────────

    pub async fn power_on(&self, vm: &ObjectRef) -> VsphereResult<TaskRef> {
        self.soap.invoke_task("PowerOnVM_Task", vm, "").await
    }

    pub async fn power_off(&self, vm: &ObjectRef) -> VsphereResult<TaskRef> {
        self.soap.invoke_task("PowerOffVM_Task", vm, "").await
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn nic_backing(&self, net: &ObjectRef) -> VsphereResult<NicBacking> {
        let name = net.label().to_string();
        if net.kind != "DistributedVirtualPortgroup" {
            return Ok(NicBacking::Standard { network: net.clone(), name });
        }

        let found = self
            .soap
            .retrieve(
                &crate::soap::ObjectSelection::Objects(std::slice::from_ref(net)),
                &["DistributedVirtualPortgroup"],
                &["key", "config.distributedVirtualSwitch"],
            )
            .await?;
        let pg = found
            .first()
            .ok_or_else(|| VsphereError::not_found(format!("Port group {name} not found")))?;
        let portgroup_key = pg.str("key").unwrap_or_default().to_string();
        let switch: ObjectRef = pg
            .get("config.distributedVirtualSwitch")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| VsphereError::parse(format!("Port group {name} has no switch")))?;

        let found = self
            .soap
            .retrieve(
                &crate::soap::ObjectSelection::Objects(std::slice::from_ref(&switch)),
                &[switch.kind.as_str()],
                &["uuid"],
            )
            .await?;
        let switch_uuid = found
            .first()
            .and_then(|s| s.str("uuid"))
            .ok_or_else(|| VsphereError::parse(format!("Switch {} has no uuid", switch.value)))?
            .to_string();

        Ok(NicBacking::Distributed { name, switch_uuid, portgroup_key })
    }
}

fn vm_summary_from_props(p: &ObjectProperties) -> Option<VmSummary> {
    Some(VmSummary {
        vm: p.obj.value.clone(),
        name: p.str("name")?.to_string(),
        power_state: p.str("runtime.powerState").map(VmPowerState::from_vim).unwrap_or_default(),
        cpu_count: p.get("config.hardware.numCPU").and_then(|v| v.as_u64()).map(|v| v as u32),
        memory_size_mib: p.get("config.hardware.memoryMB").and_then(|v| v.as_u64()),
    })
}

/// `VirtualMachineConfigSpec` body, elements in schema order.
pub(crate) fn config_spec_xml(spec: &VmCreateSpec, nic: Option<&NicBacking>) -> VsphereResult<String> {
    let datastore = spec.placement.datastore.name.as_deref().ok_or_else(|| {
        VsphereError::invalid_state(format!("Datastore {} has no name", spec.placement.datastore.value))
    })?;

    let mut out = String::new();
    out.push_str(&el("name", &spec.name));
    out.push_str(&el("guestId", &spec.guest_id));
    if let Some(annotation) = spec.annotation.as_deref().filter(|a| !a.is_empty()) {
        out.push_str(&el("annotation", annotation));
    }
    out.push_str(&format!("<files>{}</files>", el("vmPathName", &format!("[{datastore}]"))));
    out.push_str(&format!("<numCPUs>{}</numCPUs>", spec.cpu_count));
    out.push_str(&format!("<memoryMB>{}</memoryMB>", spec.memory_mb));

    out.push_str(&format!(
        concat!(
            "<deviceChange><operation>add</operation>",
            r#"<device xsi:type="ParaVirtualSCSIController"><key>{}</key>"#,
            "<deviceInfo><label>SCSI Controller</label><summary>ParaVirtual SCSI Controller</summary></deviceInfo>",
            "<busNumber>0</busNumber><sharedBus>noSharing</sharedBus></device></deviceChange>"
        ),
        SCSI_CONTROLLER_KEY
    ));

    out.push_str(&format!(
        concat!(
            "<deviceChange><operation>add</operation><fileOperation>create</fileOperation>",
            r#"<device xsi:type="VirtualDisk"><key>{key}</key>"#,
            "<deviceInfo><label>Hard Disk 1</label><summary>{size} GB disk</summary></deviceInfo>",
            r#"<backing xsi:type="VirtualDiskFlatVer2BackingInfo"><fileName>[{ds}]</fileName>{dsref}"#,
            "<diskMode>persistent</diskMode><thinProvisioned>{thin}</thinProvisioned></backing>",
            "<controllerKey>{ctrl}</controllerKey><unitNumber>0</unitNumber>",
            "<capacityInKB>{kb}</capacityInKB></device></deviceChange>"
        ),
        key = DISK_KEY,
        size = spec.disk_size_gb,
        ds = esc(datastore),
        dsref = moref("datastore", &spec.placement.datastore),
        thin = spec.thin_provisioned,
        ctrl = SCSI_CONTROLLER_KEY,
        kb = spec.disk_size_gb * 1024 * 1024,
    ));

    if let Some(nic) = nic {
        let backing = match nic {
            NicBacking::Standard { network, name } => format!(
                r#"<backing xsi:type="VirtualEthernetCardNetworkBackingInfo">{}{}</backing>"#,
                el("deviceName", name),
                moref("network", network)
            ),
            NicBacking::Distributed { switch_uuid, portgroup_key, .. } => format!(
                r#"<backing xsi:type="VirtualEthernetCardDistributedVirtualPortBackingInfo"><port>{}{}</port></backing>"#,
                el("switchUuid", switch_uuid),
                el("portgroupKey", portgroup_key)
            ),
        };
        out.push_str(&format!(
            concat!(
                "<deviceChange><operation>add</operation>",
                r#"<device xsi:type="VirtualVmxnet3"><key>{}</key>"#,
                "<deviceInfo><label>Network Adapter 1</label>{}</deviceInfo>{}",
                "<connectable><startConnected>true</startConnected><allowGuestControl>true</allowGuestControl>",
                "<connected>false</connected></connectable></device></deviceChange>"
            ),
            NIC_KEY,
            el("summary", nic.name()),
            backing
        ));
    }

    Ok(out)
}

/// `CloneVM_Task` arguments after `_this`.
pub(crate) fn clone_args_xml(spec: &VmCloneSpec) -> String {
    format!(
        "{}{}<spec><location>{}{}</location><template>false</template><powerOn>{}</powerOn></spec>",
        moref("folder", &spec.folder),
        el("name", &spec.name),
        moref("datastore", &spec.datastore),
        moref("pool", &spec.resource_pool),
        spec.power_on
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_xml;

    fn create_spec() -> VmCreateSpec {
        VmCreateSpec {
            name: "web01".into(),
            cpu_count: 2,
            memory_mb: 4096,
            disk_size_gb: 20,
            guest_id: "otherGuest".into(),
            thin_provisioned: true,
            annotation: Some("lab & test".into()),
            placement: VmPlacement {
                folder: ObjectRef::new("Folder", "group-v3"),
                resource_pool: ObjectRef::new("ResourcePool", "resgroup-8"),
                datastore: ObjectRef::named("Datastore", "datastore-11", "ssd01"),
                network: None,
            },
        }
    }

    fn parse_spec(xml: &str) -> crate::xml::XmlNode {
        let wrapped = format!(r#"<config xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">{xml}</config>"#);
        parse_xml(&wrapped).unwrap().child("config").unwrap().clone()
    }

    #[test]
    fn config_spec_orders_elements_and_sizes_disk() {
        let cfg = parse_spec(&config_spec_xml(&create_spec(), None).unwrap());
        let names: Vec<_> = cfg.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            ["name", "guestId", "annotation", "files", "numCPUs", "memoryMB", "deviceChange", "deviceChange"]
        );
        assert_eq!(cfg.text_of("annotation"), Some("lab & test"));
        assert_eq!(cfg.child("files").and_then(|f| f.text_of("vmPathName")), Some("[ssd01]"));

        let disk = cfg.children_named("deviceChange").nth(1).unwrap().child("device").unwrap();
        assert_eq!(disk.xsi_type(), Some("VirtualDisk"));
        assert_eq!(disk.text_of("capacityInKB"), Some("20971520"));
        assert_eq!(disk.text_of("controllerKey"), Some("-101"));
    }

    #[test]
    fn standard_nic_uses_network_backing() {
        let nic = NicBacking::Standard {
            network: ObjectRef::new("Network", "network-13"),
            name: "VM Network".into(),
        };
        let cfg = parse_spec(&config_spec_xml(&create_spec(), Some(&nic)).unwrap());
        let dev = cfg.children_named("deviceChange").nth(2).unwrap().child("device").unwrap();
        assert_eq!(dev.xsi_type(), Some("VirtualVmxnet3"));
        let backing = dev.child("backing").unwrap();
        assert_eq!(backing.text_of("deviceName"), Some("VM Network"));
        assert_eq!(
            backing.child("network").and_then(|n| n.to_object_ref()),
            Some(ObjectRef::new("Network", "network-13"))
        );
    }

    #[test]
    fn distributed_nic_uses_port_connection() {
        let nic = NicBacking::Distributed {
            name: "dvpg-prod".into(),
            switch_uuid: "50 2a".into(),
            portgroup_key: "dvportgroup-21".into(),
        };
        let cfg = parse_spec(&config_spec_xml(&create_spec(), Some(&nic)).unwrap());
        let dev = cfg.children_named("deviceChange").nth(2).unwrap().child("device").unwrap();
        let port = dev.child("backing").and_then(|b| b.child("port")).unwrap();
        assert_eq!(port.text_of("portgroupKey"), Some("dvportgroup-21"));
    }

    #[test]
    fn config_spec_requires_datastore_name() {
        let mut spec = create_spec();
        spec.placement.datastore.name = None;
        assert!(config_spec_xml(&spec, None).is_err());
    }

    #[test]
    fn clone_relocates_datastore_before_pool() {
        let spec = VmCloneSpec {
            source: ObjectRef::named("VirtualMachine", "vm-5", "tmpl-ubuntu"),
            name: "web02".into(),
            folder: ObjectRef::new("Folder", "group-v3"),
            resource_pool: ObjectRef::new("ResourcePool", "resgroup-8"),
            datastore: ObjectRef::new("Datastore", "datastore-11"),
            power_on: false,
        };
        let xml = clone_args_xml(&spec);
        let ds = xml.find("<datastore").unwrap();
        let pool = xml.find("<pool").unwrap();
        assert!(ds < pool);
        assert!(xml.contains("<name>web02</name>"));
    }

    #[test]
    fn summary_from_properties() {
        let mut props = serde_json::Map::new();
        props.insert("name".into(), "db01".into());
        props.insert("runtime.powerState".into(), "poweredOff".into());
        props.insert("config.hardware.numCPU".into(), 4.into());
        let p = ObjectProperties { obj: ObjectRef::new("VirtualMachine", "vm-3"), props };
        let vm = vm_summary_from_props(&p).unwrap();
        assert_eq!(vm.power_state, VmPowerState::PoweredOff);
        assert_eq!(vm.cpu_count, Some(4));
        assert_eq!(vm.memory_size_mib, None);
    }
}
