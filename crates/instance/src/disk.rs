//! Merging disk presets with per-invocation overrides.

use std::str::FromStr;

use crate::config::DiskPreset;
use crate::error::{Error, Result};
use crate::spec::DiskSpec;

/// Disk buses a volume can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum DiskBus {
    Virtio,
    Scsi,
}

impl DiskBus {
    /// Target device name prefix, e.g. `vd` for `vda`.
    pub(crate) fn dev_prefix(self) -> &'static str {
        match self {
            DiskBus::Virtio => "vd",
            DiskBus::Scsi => "sd",
        }
    }

    /// How many disks the bus can carry.
    pub(crate) fn max_devices(self) -> usize {
        match self {
            DiskBus::Virtio => 32,
            DiskBus::Scsi => 1024,
        }
    }
}

/// Host page cache mode for the disk driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum DiskCache {
    Default,
    #[default]
    None,
    Writethrough,
    Writeback,
    Directsync,
    Unsafe,
}

/// What a disk is for, which decides its volume name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DiskRole {
    /// The Nth `--disk`, counted from 1.
    Data(usize),
    Seed,
}

impl DiskRole {
    pub(crate) fn volume_name(self, vm_name: &str) -> String {
        match self {
            DiskRole::Data(n) => format!("{vm_name}-disk{n}"),
            DiskRole::Seed => format!("{vm_name}-seed"),
        }
    }
}

/// Where to clone a new volume from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CloneSource {
    pub(crate) pool: String,
    pub(crate) volume: String,
}

/// A disk with every preset value and override folded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedDisk {
    pub(crate) volume: String,
    pub(crate) pool: String,
    pub(crate) bus: DiskBus,
    pub(crate) cache: DiskCache,
    pub(crate) source: Option<CloneSource>,
    pub(crate) boot_order: Option<u32>,
    /// Requested capacity in bytes; `None` for the seed disk until the
    /// image has been built.
    pub(crate) size: Option<u64>,
}

fn parse_enum<T: FromStr>(what: &str, value: &str, preset: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::validation(format!("disk {preset}: unsupported {what} '{value}'")))
}

/// Merge `spec` over `preset`. Pure: the same inputs always give the same
/// disk.
pub(crate) fn resolve_disk(
    spec: &DiskSpec,
    preset: &DiskPreset,
    role: DiskRole,
    vm_name: &str,
) -> Result<ResolvedDisk> {
    let name = spec.preset.as_str();
    let o = &spec.overrides;

    match preset.kind.as_deref() {
        None | Some("volume") => {}
        Some(other) => {
            return Err(Error::validation(format!(
                "disk preset {name} is of type {other}; only volume presets are supported"
            )))
        }
    }

    let pool = o
        .pool
        .clone()
        .or_else(|| preset.pool.clone())
        .ok_or_else(|| Error::validation(format!("disk {name}: no pool given")))?;
    let bus = o
        .bus
        .as_deref()
        .or(preset.bus.as_deref())
        .ok_or_else(|| Error::validation(format!("disk {name}: no bus given")))
        .and_then(|b| parse_enum::<DiskBus>("bus", b, name))?;
    let cache = match o.cache.as_deref().or(preset.cache.as_deref()) {
        Some(c) => parse_enum::<DiskCache>("cache mode", c, name)?,
        None => DiskCache::default(),
    };

    // The seed disk only ever takes pool, bus and cache from its preset.
    let (source, source_pool, boot_order) = match role {
        DiskRole::Seed => (None, None, None),
        DiskRole::Data(_) => (
            o.source.clone().or_else(|| preset.source.clone()),
            o.source_pool.clone().or_else(|| preset.source_pool.clone()),
            o.boot_order.or(preset.boot_order),
        ),
    };
    let source = match (source, source_pool) {
        (Some(volume), source_pool) => Some(CloneSource {
            pool: source_pool.unwrap_or_else(|| pool.clone()),
            volume,
        }),
        (None, Some(_)) => {
            return Err(Error::validation(format!(
                "disk {name}: source-pool given without source"
            )))
        }
        (None, None) => None,
    };

    let size = match role {
        DiskRole::Data(_) => Some(
            spec.size
                .ok_or_else(|| Error::validation(format!("disk {name}: no size given")))?,
        ),
        DiskRole::Seed => None,
    };

    Ok(ResolvedDisk {
        volume: role.volume_name(vm_name),
        pool,
        bus,
        cache,
        source,
        boot_order,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{parse_disk_spec, parse_seed_disk_spec};

    fn preset() -> DiskPreset {
        DiskPreset {
            kind: Some("volume".into()),
            pool: Some("default".into()),
            bus: Some("virtio".into()),
            cache: Some("none".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let spec = parse_disk_spec("local,10GiB,bus=scsi").unwrap();
        let a = resolve_disk(&spec, &preset(), DiskRole::Data(1), "vm1").unwrap();
        let b = resolve_disk(&spec, &preset(), DiskRole::Data(1), "vm1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_volume_naming() {
        let spec = parse_disk_spec("local,1GiB").unwrap();
        let names: Vec<_> = (1..=3)
            .map(|n| {
                resolve_disk(&spec, &preset(), DiskRole::Data(n), "web")
                    .unwrap()
                    .volume
            })
            .collect();
        assert_eq!(names, ["web-disk1", "web-disk2", "web-disk3"]);

        let seed = parse_seed_disk_spec("local").unwrap();
        let disk = resolve_disk(&seed, &preset(), DiskRole::Seed, "web").unwrap();
        assert_eq!(
            disk,
            ResolvedDisk {
                volume: "web-seed".into(),
                pool: "default".into(),
                bus: DiskBus::Virtio,
                cache: DiskCache::None,
                source: None,
                boot_order: None,
                size: None,
            }
        );
    }

    #[test]
    fn test_override_precedence() {
        let spec = parse_disk_spec("local,1GiB,cache=writeback").unwrap();
        let disk = resolve_disk(&spec, &preset(), DiskRole::Data(1), "vm").unwrap();
        assert_eq!(disk.cache, DiskCache::Writeback);
        assert_eq!(disk.pool, "default");
        assert_eq!(disk.bus, DiskBus::Virtio);
        assert_eq!(disk.size, Some(1024 * 1024 * 1024));

        let mut p = preset();
        p.cache = None;
        let spec = parse_disk_spec("local,1GiB").unwrap();
        let disk = resolve_disk(&spec, &p, DiskRole::Data(1), "vm").unwrap();
        assert_eq!(disk.cache, DiskCache::None);
    }

    #[test]
    fn test_clone_source() {
        let spec = parse_disk_spec("local,1GiB,source=base.img").unwrap();
        let disk = resolve_disk(&spec, &preset(), DiskRole::Data(1), "vm").unwrap();
        assert_eq!(
            disk.source,
            Some(CloneSource {
                pool: "default".into(),
                volume: "base.img".into()
            })
        );

        let spec = parse_disk_spec("local,1GiB,source=base.img,source-pool=images").unwrap();
        let disk = resolve_disk(&spec, &preset(), DiskRole::Data(1), "vm").unwrap();
        assert_eq!(disk.source.unwrap().pool, "images");

        let spec = parse_disk_spec("local,1GiB,source-pool=images").unwrap();
        assert!(matches!(
            resolve_disk(&spec, &preset(), DiskRole::Data(1), "vm"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_seed_ignores_data_only_preset_fields() {
        let mut p = preset();
        p.source = Some("base.img".into());
        p.boot_order = Some(1);
        let spec = parse_seed_disk_spec("local").unwrap();
        let disk = resolve_disk(&spec, &p, DiskRole::Seed, "vm").unwrap();
        assert_eq!(disk.source, None);
        assert_eq!(disk.boot_order, None);
    }

    #[test]
    fn test_invalid_disks() {
        let spec = parse_disk_spec("local,1GiB,bus=ide").unwrap();
        assert!(resolve_disk(&spec, &preset(), DiskRole::Data(1), "vm").is_err());

        let spec = parse_disk_spec("local,1GiB,cache=sometimes").unwrap();
        assert!(resolve_disk(&spec, &preset(), DiskRole::Data(1), "vm").is_err());

        let spec = parse_disk_spec("local,1GiB").unwrap();
        let mut p = preset();
        p.pool = None;
        assert!(resolve_disk(&spec, &p, DiskRole::Data(1), "vm").is_err());

        let mut p = preset();
        p.kind = Some("file".into());
        let seed = parse_seed_disk_spec("local").unwrap();
        assert!(matches!(
            resolve_disk(&seed, &p, DiskRole::Seed, "vm"),
            Err(Error::Validation(_))
        ));
    }
}
