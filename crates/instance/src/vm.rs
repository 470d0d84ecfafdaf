//! The fully resolved description of the machine to create.

use std::collections::BTreeMap;

use crate::disk::ResolvedDisk;
use crate::error::{Error, Result};
use crate::interface::ResolvedInterface;
use crate::storage::AttachedDisk;
use crate::xml::Element;

#[derive(Debug, Clone)]
pub(crate) struct VmSpec {
    pub(crate) name: String,
    /// Domain UUID; also the cloud-init instance id
    pub(crate) instance_id: String,
    pub(crate) arch: String,
    pub(crate) machine_type: String,
    pub(crate) domain_type: String,
    /// `None` means host CPU passthrough
    pub(crate) cpu_model: Option<String>,
    pub(crate) vcpus: u32,
    /// Memory in bytes
    pub(crate) memory: u64,
    pub(crate) disks: Vec<AttachedDisk>,
    pub(crate) interfaces: Vec<ResolvedInterface>,
    /// Index into `disks` of the cloud-init seed disk
    pub(crate) seed: Option<usize>,
    /// Parsed base domain template
    pub(crate) template: Option<Element>,
}

/// Boot orders requested for new disks and interfaces, labelled for error
/// messages.
pub(crate) fn requested_boot_orders(
    disks: &[ResolvedDisk],
    interfaces: &[ResolvedInterface],
) -> Vec<(String, u32)> {
    let disks = disks
        .iter()
        .filter_map(|d| d.boot_order.map(|o| (format!("disk {}", d.volume), o)));
    let nics = interfaces
        .iter()
        .enumerate()
        .filter_map(|(i, n)| n.boot_order.map(|o| (format!("interface {}", i + 1), o)));
    disks.chain(nics).collect()
}

/// Reject two devices asking for the same boot order.
///
/// `devices` pairs a human readable device label with its boot order.
pub(crate) fn check_boot_order(devices: impl IntoIterator<Item = (String, u32)>) -> Result<()> {
    let mut seen: BTreeMap<u32, String> = BTreeMap::new();
    for (device, order) in devices {
        if let Some(first) = seen.get(&order) {
            return Err(Error::validation(format!(
                "boot order {order} is used by both {first} and {device}"
            )));
        }
        seen.insert(order, device);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_boot_order() {
        check_boot_order(vec![("disk vm-disk1".to_owned(), 1), ("nic 1".to_owned(), 2)]).unwrap();
        check_boot_order(Vec::new()).unwrap();

        let err = check_boot_order(vec![
            ("disk vm-disk1".to_owned(), 1),
            ("nic 1".to_owned(), 1),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(
            err.to_string(),
            "boot order 1 is used by both disk vm-disk1 and nic 1"
        );
    }
}
