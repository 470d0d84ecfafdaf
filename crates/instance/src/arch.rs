//! Architecture specific defaults for generated domain skeletons
//!
//! Used when a domain preset carries no XML template: the skeleton gets the
//! features, timers and console devices that suit the guest architecture.

use crate::xml::Element;

/// Architecture configuration for a generated libvirt domain
#[derive(Debug, Clone)]
pub(crate) struct ArchConfig<'a> {
    /// Architecture string for libvirt (e.g., "x86_64", "aarch64")
    pub(crate) arch: &'a str,
}

impl<'a> ArchConfig<'a> {
    pub(crate) fn new(arch: &'a str) -> Self {
        Self { arch }
    }

    /// Check if this architecture supports VMport (x86_64 specific feature)
    fn supports_vmport(&self) -> bool {
        self.arch == "x86_64"
    }

    /// Get architecture-specific `<features>`
    pub(crate) fn features(&self) -> Element {
        let mut features = Element::new("features").with_child(Element::new("acpi"));
        match self.arch {
            "x86_64" | "i686" => {
                features.push(Element::new("apic"));
            }
            "aarch64" => {
                features.push(Element::new("gic").with_attr("version", "3"));
            }
            _ => {}
        }
        if self.supports_vmport() {
            features.push(Element::new("vmport").with_attr("state", "off"));
        }
        features
    }

    /// Get architecture-specific `<clock>` with its timers
    pub(crate) fn clock(&self) -> Element {
        let timer = |name: &str, attr: &str, value: &str| {
            Element::new("timer")
                .with_attr("name", name)
                .with_attr(attr, value)
        };
        let mut clock = Element::new("clock")
            .with_attr("offset", "utc")
            .with_child(timer("rtc", "tickpolicy", "catchup"));
        if self.arch == "x86_64" {
            clock.push(timer("pit", "tickpolicy", "delay"));
            clock.push(timer("hpet", "present", "no"));
        }
        clock
    }

    /// UEFI is the only way to boot a virt machine on aarch64
    fn os(&self) -> Element {
        let os = Element::new("os");
        match self.arch {
            "aarch64" => os.with_attr("firmware", "efi"),
            _ => os,
        }
    }

    /// A headless `<domain>` with no disks or interfaces. The synthesizer
    /// fills in everything that depends on the invocation.
    pub(crate) fn skeleton(&self) -> Element {
        let console_target = Element::new("target")
            .with_attr("type", "serial")
            .with_attr("port", "0");
        Element::new("domain")
            .with_child(self.os())
            .with_child(self.features())
            .with_child(self.clock())
            .with_child(Element::new("on_poweroff").with_text("destroy"))
            .with_child(Element::new("on_reboot").with_text("restart"))
            .with_child(Element::new("on_crash").with_text("destroy"))
            .with_child(
                Element::new("devices")
                    .with_child(
                        Element::new("serial")
                            .with_attr("type", "pty")
                            .with_child(Element::new("target").with_attr("port", "0")),
                    )
                    .with_child(
                        Element::new("console")
                            .with_attr("type", "pty")
                            .with_child(console_target),
                    )
                    .with_child(Element::new("memballoon").with_attr("model", "virtio")),
            )
    }
}
