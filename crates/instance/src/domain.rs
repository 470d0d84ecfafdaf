//! Domain XML synthesis.
//!
//! A domain document is produced by editing a base template (or a generated
//! skeleton) in place: the regions this tool owns are replaced or inserted,
//! everything else the template carries is passed through untouched.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::arch::ArchConfig;
use crate::disk::DiskBus;
use crate::error::{Error, Result};
use crate::interface::{InterfaceMode, ResolvedInterface};
use crate::storage::{AttachedDisk, DiskSource, InlineSource};
use crate::utils::index_to_drive_name;
use crate::vm::{check_boot_order, requested_boot_orders, VmSpec};
use crate::xml::{Element, XmlError};

/// Highest LUN a virtio-scsi controller accepts on one target.
const SCSI_MAX_UNITS: u32 = 16384;
const SCSI_MAX_CONTROLLERS: usize = 32;
const SCSI_CONTROLLER_MODEL: &str = "virtio-scsi";

/// Parse a domain template, requiring a `<domain>` root.
pub(crate) fn parse_template(text: &str) -> Result<Element> {
    let root = Element::parse(text).map_err(Error::Template)?;
    if root.name != "domain" {
        return Err(Error::Template(XmlError::UnexpectedRoot {
            expected: "domain".into(),
            found: root.name,
        }));
    }
    Ok(root)
}

/// Boot orders already assigned to devices in a template.
pub(crate) fn template_boot_orders(template: Option<&Element>) -> Result<Vec<(String, u32)>> {
    let mut orders = Vec::new();
    let Some(template) = template else {
        return Ok(orders);
    };
    for devices in template.children_named("devices") {
        for dev in devices.elements() {
            for boot in dev.children_named("boot") {
                let Some(order) = boot.attr("order") else {
                    continue;
                };
                let label = match dev.find("target").and_then(|t| t.attr("dev")) {
                    Some(target) => format!("template {} {target}", dev.name),
                    None => format!("template {}", dev.name),
                };
                let order = order.parse().map_err(|_| {
                    Error::validation(format!("{label} has an invalid boot order '{order}'"))
                })?;
                orders.push((label, order));
            }
        }
    }
    Ok(orders)
}

/// The host capabilities document (`virsh capabilities`).
#[derive(Debug, Clone)]
pub(crate) struct HostCapabilities {
    root: Element,
}

impl HostCapabilities {
    pub(crate) fn parse(xml: &str) -> Result<Self> {
        let root = Element::parse(xml)
            .map_err(|e| Error::validation(format!("unreadable host capabilities: {e}")))?;
        Ok(Self { root })
    }

    /// Architecture of the host CPU, used when neither the invocation nor
    /// the preset names one.
    pub(crate) fn host_arch(&self) -> Option<String> {
        self.root
            .find("host/cpu/arch")
            .and_then(|a| a.text())
            .map(|a| a.trim().to_owned())
            .filter(|a| !a.is_empty())
    }

    /// Find the emulator binary for a domain type, architecture and machine.
    ///
    /// The machine may be listed either under the matching `<domain>` or
    /// directly under the `<arch>`; a domain specific emulator wins over the
    /// architecture default.
    pub(crate) fn emulator(&self, domain_type: &str, arch: &str, machine: &str) -> Result<String> {
        let lists_machine = |el: &Element| {
            el.children_named("machine")
                .any(|m| m.text().as_deref().map(str::trim) == Some(machine))
        };
        let text_of = |el: Option<&Element>| {
            el.and_then(|e| e.text())
                .map(|t| t.trim().to_owned())
                .filter(|t| !t.is_empty())
        };

        for guest in self.root.children_named("guest") {
            if text_of(guest.child("os_type")).as_deref() != Some("hvm") {
                continue;
            }
            for arch_el in guest
                .children_named("arch")
                .filter(|a| a.attr("name") == Some(arch))
            {
                let Some(domain) = arch_el
                    .children_named("domain")
                    .find(|d| d.attr("type") == Some(domain_type))
                else {
                    continue;
                };
                if !lists_machine(domain) && !lists_machine(arch_el) {
                    continue;
                }
                return text_of(domain.child("emulator"))
                    .or_else(|| text_of(arch_el.child("emulator")))
                    .ok_or_else(|| {
                        Error::validation(format!(
                            "host capabilities list no emulator for architecture {arch}"
                        ))
                    });
            }
        }
        Err(Error::validation(format!(
            "no {domain_type} guest for architecture {arch} with machine type {machine} in host capabilities"
        )))
    }
}

/// A synthesized `<domain>` document, ready to be defined.
#[derive(Debug, Clone)]
pub(crate) struct DomainDefinition {
    root: Element,
}

impl DomainDefinition {
    pub(crate) fn synthesize(vm: &VmSpec, caps: &HostCapabilities) -> Result<Self> {
        let mut root = match &vm.template {
            Some(template) => template.clone(),
            None => {
                debug!("No template, generating a skeleton for {}", vm.arch);
                ArchConfig::new(&vm.arch).skeleton()
            }
        };
        if root.name != "domain" {
            return Err(Error::Template(XmlError::UnexpectedRoot {
                expected: "domain".into(),
                found: root.name,
            }));
        }

        let mut boot_orders = template_boot_orders(Some(&root))?;
        let resolved: Vec<_> = vm.disks.iter().map(|d| d.disk.clone()).collect();
        boot_orders.extend(requested_boot_orders(&resolved, &vm.interfaces));
        let any_boot_order = !boot_orders.is_empty();
        check_boot_order(boot_orders)?;

        root.set_attr("type", &vm.domain_type);
        set_identity(&mut root, vm);
        set_os(&mut root, vm, any_boot_order);
        set_cpu(&mut root, vm.cpu_model.as_deref());

        let emulator = caps.emulator(&vm.domain_type, &vm.arch, &vm.machine_type)?;
        let devices = root.slot("devices").or_insert();
        devices.remove_children("emulator");
        devices.prepend(Element::new("emulator").with_text(emulator));

        for disk in &vm.disks {
            add_disk(devices, disk)?;
        }
        for nic in &vm.interfaces {
            devices.push(interface_element(nic));
        }

        Ok(Self { root })
    }

    pub(crate) fn to_xml(&self) -> Result<String> {
        self.root.to_xml().map_err(Error::Template)
    }
}

fn set_identity(root: &mut Element, vm: &VmSpec) {
    for name in ["name", "uuid", "memory", "currentMemory", "vcpu"] {
        root.remove_children(name);
    }
    // Prepended in reverse so they end up as name, uuid, memory, vcpu.
    root.prepend(
        Element::new("vcpu")
            .with_attr("placement", "static")
            .with_text(vm.vcpus.to_string()),
    );
    root.prepend(
        Element::new("memory")
            .with_attr("unit", "bytes")
            .with_text(vm.memory.to_string()),
    );
    root.prepend(Element::new("uuid").with_text(&vm.instance_id));
    root.prepend(Element::new("name").with_text(&vm.name));
}

fn set_os(root: &mut Element, vm: &VmSpec, per_device_boot: bool) {
    let os = root.slot("os").or_insert();
    os.remove_children("type");
    os.prepend(
        Element::new("type")
            .with_attr("arch", &vm.arch)
            .with_attr("machine", &vm.machine_type)
            .with_text("hvm"),
    );
    // libvirt rejects <os><boot> combined with per-device boot orders
    if per_device_boot && os.remove_children("boot") > 0 {
        debug!("Dropped <os><boot> in favour of per-device boot order");
    }
}

fn set_cpu(root: &mut Element, cpu_model: Option<&str>) {
    match cpu_model {
        Some(model) => {
            root.slot("cpu").replace(
                Element::new("cpu")
                    .with_attr("mode", "custom")
                    .with_attr("match", "exact")
                    .with_attr("check", "partial")
                    .with_child(
                        Element::new("model")
                            .with_attr("fallback", "allow")
                            .with_text(model),
                    ),
            );
        }
        None => {
            if root.child("cpu").is_none() {
                root.push(
                    Element::new("cpu")
                        .with_attr("mode", "host-passthrough")
                        .with_attr("check", "none")
                        .with_attr("migratable", "on"),
                );
            }
        }
    }
}

/// Pick the first free target device name on `bus`.
fn allocate_target(devices: &Element, bus: DiskBus) -> Result<String> {
    let used: HashSet<&str> = devices
        .find_all("disk/target")
        .into_iter()
        .filter_map(|t| t.attr("dev"))
        .collect();
    (0..bus.max_devices())
        .map(|i| format!("{}{}", bus.dev_prefix(), index_to_drive_name(i)))
        .find(|dev| !used.contains(dev.as_str()))
        .ok_or_else(|| {
            Error::validation(format!(
                "all {} disk devices on the {bus} bus are already used",
                bus.max_devices()
            ))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ScsiAddress {
    controller: u32,
    bus: u32,
    target: u32,
    unit: u32,
}

fn parse_index(el: &Element, key: &str) -> Option<u32> {
    el.attr(key).unwrap_or("0").parse().ok()
}

/// Find a free drive address on a virtio-scsi controller, adding a
/// controller to `devices` when every existing one is full.
fn allocate_scsi_address(devices: &mut Element) -> Result<ScsiAddress> {
    let used: BTreeSet<ScsiAddress> = devices
        .children_named("disk")
        .filter(|d| d.find("target").and_then(|t| t.attr("bus")) == Some("scsi"))
        .filter_map(|d| d.children_named("address").find(|a| a.attr("type") == Some("drive")))
        .filter_map(|a| {
            Some(ScsiAddress {
                controller: parse_index(a, "controller")?,
                bus: parse_index(a, "bus")?,
                target: parse_index(a, "target")?,
                unit: parse_index(a, "unit")?,
            })
        })
        .collect();

    let scsi_controllers: Vec<&Element> = devices
        .children_named("controller")
        .filter(|c| c.attr("type") == Some("scsi"))
        .collect();
    let virtio_indexes: Vec<u32> = scsi_controllers
        .iter()
        .filter(|c| c.attr("model") == Some(SCSI_CONTROLLER_MODEL))
        .filter_map(|c| parse_index(c, "index"))
        .collect();

    for &controller in &virtio_indexes {
        let free = (0..SCSI_MAX_UNITS)
            .map(|unit| ScsiAddress {
                controller,
                bus: 0,
                target: 0,
                unit,
            })
            .find(|addr| !used.contains(addr));
        if let Some(addr) = free {
            return Ok(addr);
        }
    }

    if virtio_indexes.len() >= SCSI_MAX_CONTROLLERS {
        return Err(Error::validation("all SCSI controllers are full"));
    }
    let controller = scsi_controllers
        .iter()
        .filter_map(|c| parse_index(c, "index"))
        .max()
        .map_or(0, |i| i + 1);
    debug!("Adding virtio-scsi controller {controller}");
    devices.push(
        Element::new("controller")
            .with_attr("type", "scsi")
            .with_attr("index", controller.to_string())
            .with_attr("model", SCSI_CONTROLLER_MODEL),
    );
    Ok(ScsiAddress {
        controller,
        bus: 0,
        target: 0,
        unit: 0,
    })
}

fn source_element(source: &DiskSource) -> (&'static str, Element) {
    match source {
        DiskSource::Volume { pool, volume } => (
            "volume",
            Element::new("source")
                .with_attr("pool", pool)
                .with_attr("volume", volume),
        ),
        DiskSource::Inline(InlineSource::File { path }) => {
            ("file", Element::new("source").with_attr("file", path))
        }
        DiskSource::Inline(InlineSource::Block { dev }) => {
            ("block", Element::new("source").with_attr("dev", dev))
        }
        DiskSource::Inline(InlineSource::Rbd { name, hosts, auth }) => {
            let mut source = Element::new("source")
                .with_attr("protocol", "rbd")
                .with_attr("name", name);
            for host in hosts {
                let mut el = Element::new("host").with_attr("name", &host.name);
                if let Some(port) = &host.port {
                    el.set_attr("port", port);
                }
                source.push(el);
            }
            if let Some(auth) = auth {
                source.push(
                    Element::new("auth")
                        .with_attr("username", &auth.username)
                        .with_child(
                            Element::new("secret")
                                .with_attr("type", "ceph")
                                .with_attr("uuid", &auth.secret_uuid),
                        ),
                );
            }
            ("network", source)
        }
    }
}

fn add_disk(devices: &mut Element, attached: &AttachedDisk) -> Result<()> {
    let disk = &attached.disk;
    let dev = allocate_target(devices, disk.bus)?;
    let (kind, source) = source_element(&attached.source);

    let mut el = Element::new("disk")
        .with_attr("type", kind)
        .with_attr("device", "disk")
        .with_child(source)
        .with_child(
            Element::new("target")
                .with_attr("dev", &dev)
                .with_attr("bus", disk.bus.to_string()),
        )
        .with_child(
            Element::new("driver")
                .with_attr("name", "qemu")
                .with_attr("type", "raw")
                .with_attr("cache", disk.cache.to_string()),
        );
    if let Some(order) = disk.boot_order {
        el.push(Element::new("boot").with_attr("order", order.to_string()));
    }
    if disk.bus == DiskBus::Scsi {
        let addr = allocate_scsi_address(devices)?;
        el.push(
            Element::new("address")
                .with_attr("type", "drive")
                .with_attr("controller", addr.controller.to_string())
                .with_attr("bus", addr.bus.to_string())
                .with_attr("target", addr.target.to_string())
                .with_attr("unit", addr.unit.to_string()),
        );
    }
    debug!("Attaching {} as {dev}", disk.volume);
    devices.push(el);
    Ok(())
}

fn interface_element(nic: &ResolvedInterface) -> Element {
    let (kind, source) = match &nic.mode {
        InterfaceMode::Network(name) => ("network", Element::new("source").with_attr("network", name)),
        InterfaceMode::Bridge(name) => ("bridge", Element::new("source").with_attr("bridge", name)),
    };
    let mut el = Element::new("interface")
        .with_attr("type", kind)
        .with_child(source);
    if let Some(mac) = &nic.mac_address {
        el.push(Element::new("mac").with_attr("address", mac));
    }
    el.push(Element::new("model").with_attr("type", &nic.model_type));
    if let Some(mtu) = nic.mtu {
        el.push(Element::new("mtu").with_attr("size", mtu.to_string()));
    }
    if let Some(order) = nic.boot_order {
        el.push(Element::new("boot").with_attr("order", order.to_string()));
    }
    el
}
