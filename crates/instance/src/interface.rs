//! Merging interface presets with per-invocation overrides.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::InterfacePreset;
use crate::error::{Error, Result};
use crate::spec::InterfaceSpec;

const DEFAULT_MODEL_TYPE: &str = "virtio";

/// What the guest NIC is plugged into on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InterfaceMode {
    /// A libvirt virtual network
    Network(String),
    /// An existing host bridge
    Bridge(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedInterface {
    pub(crate) mode: InterfaceMode,
    pub(crate) model_type: String,
    /// Host side link MTU
    pub(crate) mtu: Option<u32>,
    pub(crate) mac_address: Option<String>,
    pub(crate) boot_order: Option<u32>,
}

fn mac_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("valid MAC address regex")
    })
}

pub(crate) fn resolve_interface(
    spec: &InterfaceSpec,
    preset: &InterfacePreset,
) -> Result<ResolvedInterface> {
    let name = spec.preset.as_str();
    let o = &spec.overrides;

    let network = o.network.clone().or_else(|| preset.network.clone());
    let bridge = o.bridge.clone().or_else(|| preset.bridge.clone());

    let mode = match (preset.kind.as_deref(), network, bridge) {
        (_, Some(_), Some(_)) => {
            return Err(Error::validation(format!(
                "interface {name}: network and bridge are mutually exclusive"
            )))
        }
        (Some("network") | None, Some(network), None) => InterfaceMode::Network(network),
        (Some("bridge") | None, None, Some(bridge)) => InterfaceMode::Bridge(bridge),
        (Some("network"), None, _) => {
            return Err(Error::validation(format!(
                "interface {name}: type network requires a network name"
            )))
        }
        (Some("bridge"), _, None) => {
            return Err(Error::validation(format!(
                "interface {name}: type bridge requires a bridge name"
            )))
        }
        (None, None, None) => {
            return Err(Error::validation(format!(
                "interface {name}: neither network nor bridge given"
            )))
        }
        (Some(other), _, _) => {
            return Err(Error::validation(format!(
                "interface {name}: unsupported type '{other}'"
            )))
        }
    };

    let mac_address = o.mac_address.clone().or_else(|| preset.mac_address.clone());
    if let Some(mac) = &mac_address {
        if !mac_regex().is_match(mac) {
            return Err(Error::validation(format!(
                "interface {name}: invalid MAC address '{mac}'"
            )));
        }
    }

    Ok(ResolvedInterface {
        mode,
        model_type: o
            .model_type
            .clone()
            .or_else(|| preset.model_type.clone())
            .unwrap_or_else(|| DEFAULT_MODEL_TYPE.to_owned()),
        mtu: o.mtu.or(preset.mtu),
        mac_address,
        boot_order: o.boot_order.or(preset.boot_order),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parse_interface_spec;

    fn network_preset() -> InterfacePreset {
        InterfacePreset {
            kind: Some("network".into()),
            network: Some("default".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_network_interface() {
        let spec = parse_interface_spec("lan,mtu=9000,boot-order=2").unwrap();
        let nic = resolve_interface(&spec, &network_preset()).unwrap();
        assert_eq!(nic.mode, InterfaceMode::Network("default".into()));
        assert_eq!(nic.model_type, "virtio");
        assert_eq!(nic.mtu, Some(9000));
        assert_eq!(nic.boot_order, Some(2));
    }

    #[test]
    fn test_bridge_interface() {
        let preset = InterfacePreset {
            kind: Some("bridge".into()),
            bridge: Some("br0".into()),
            model_type: Some("e1000".into()),
            ..Default::default()
        };
        let spec = parse_interface_spec("br,bridge=br1,mac-address=52:54:00:12:34:56").unwrap();
        let nic = resolve_interface(&spec, &preset).unwrap();
        assert_eq!(nic.mode, InterfaceMode::Bridge("br1".into()));
        assert_eq!(nic.model_type, "e1000");
        assert_eq!(nic.mac_address.as_deref(), Some("52:54:00:12:34:56"));
    }

    #[test]
    fn test_untyped_preset_infers_mode() {
        let preset = InterfacePreset::default();
        let spec = parse_interface_spec("any,bridge=br0").unwrap();
        let nic = resolve_interface(&spec, &preset).unwrap();
        assert_eq!(nic.mode, InterfaceMode::Bridge("br0".into()));
    }

    #[test]
    fn test_invalid_interfaces() {
        let spec = parse_interface_spec("lan,bridge=br0").unwrap();
        assert!(matches!(
            resolve_interface(&spec, &network_preset()),
            Err(Error::Validation(_))
        ));

        let spec = parse_interface_spec("lan,mac-address=52:54:00:zz:00:00").unwrap();
        assert!(resolve_interface(&spec, &network_preset()).is_err());

        let preset = InterfacePreset {
            kind: Some("direct".into()),
            network: Some("default".into()),
            ..Default::default()
        };
        let spec = parse_interface_spec("lan").unwrap();
        assert!(resolve_interface(&spec, &preset).is_err());

        let preset = InterfacePreset {
            kind: Some("bridge".into()),
            ..Default::default()
        };
        assert!(resolve_interface(&spec, &preset).is_err());

        assert!(resolve_interface(&spec, &InterfacePreset::default()).is_err());
    }
}
