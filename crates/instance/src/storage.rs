//! Storage planning: decides for every disk how it will be attached and
//! what volume has to be created for it.
//!
//! Some pool backends cannot be referenced from a domain as `pool` +
//! `volume`; for those the connection parameters (file path, block device,
//! RBD monitors and auth) are written into the disk source directly.

use std::collections::BTreeMap;

use strum::IntoEnumIterator;
use tracing::debug;
use yaml_rust2::Yaml;

use crate::config::hash;
use crate::disk::{CloneSource, ResolvedDisk};
use crate::error::{Error, Result};
use crate::libvirt::Libvirt;
use crate::utils::{align_up, parse_size, MIB};
use crate::xml::Element;

/// libvirt storage pool types understood by the planner.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum PoolBackend {
    Dir,
    Fs,
    Netfs,
    Logical,
    Zfs,
    Rbd,
}

/// The shape of an inlined disk source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum ConnectionShape {
    File,
    Block,
    Rbd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Capability {
    /// Whether a domain disk may refer to volumes of this backend by
    /// pool and volume name.
    pub(crate) supports_reference: bool,
    pub(crate) connection: ConnectionShape,
}

impl PoolBackend {
    fn default_capability(self) -> Capability {
        let (supports_reference, connection) = match self {
            PoolBackend::Dir | PoolBackend::Fs | PoolBackend::Netfs => (true, ConnectionShape::File),
            PoolBackend::Logical | PoolBackend::Zfs => (true, ConnectionShape::Block),
            PoolBackend::Rbd => (false, ConnectionShape::Rbd),
        };
        Capability {
            supports_reference,
            connection,
        }
    }
}

/// Per-backend capabilities, with overrides from the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CapabilityTable {
    overrides: BTreeMap<PoolBackend, bool>,
}

impl CapabilityTable {
    pub(crate) fn get(&self, backend: PoolBackend) -> Capability {
        let mut cap = backend.default_capability();
        if let Some(supports_reference) = self.overrides.get(&backend) {
            cap.supports_reference = *supports_reference;
        }
        cap
    }

    pub(crate) fn apply_overrides(&mut self, overrides: &[(PoolBackend, bool)]) {
        self.overrides.extend(overrides.iter().copied());
    }

    pub(crate) fn to_yaml(&self) -> Yaml {
        let names: Vec<(PoolBackend, String)> =
            PoolBackend::iter().map(|b| (b, b.to_string())).collect();
        let mut m = BTreeMap::new();
        for (backend, name) in &names {
            let cap = self.get(*backend);
            let mut entry = BTreeMap::new();
            entry.insert("connection", Yaml::String(cap.connection.to_string()));
            entry.insert("supports-reference", Yaml::Boolean(cap.supports_reference));
            m.insert(name.as_str(), hash(entry));
        }
        hash(m)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RbdHost {
    pub(crate) name: String,
    pub(crate) port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RbdAuth {
    pub(crate) username: String,
    pub(crate) secret_uuid: String,
}

/// The facts about a pool the planner needs, read from `pool-dumpxml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolInfo {
    pub(crate) name: String,
    pub(crate) backend: PoolBackend,
    pub(crate) target_path: Option<String>,
    pub(crate) source_name: Option<String>,
    pub(crate) hosts: Vec<RbdHost>,
    pub(crate) auth: Option<RbdAuth>,
}

impl PoolInfo {
    pub(crate) fn parse(pool: &str, xml: &str) -> Result<Self> {
        let root = Element::parse(xml)
            .map_err(|e| Error::capability(pool, format!("unreadable pool definition: {e}")))?;
        let kind = root
            .attr("type")
            .ok_or_else(|| Error::capability(pool, "pool definition has no type"))?;
        let backend: PoolBackend = kind
            .parse()
            .map_err(|_| Error::capability(pool, format!("unsupported pool type '{kind}'")))?;

        let text_of = |path: &str| {
            root.find(path)
                .and_then(|e| e.text())
                .map(|t| t.trim().to_owned())
                .filter(|t| !t.is_empty())
        };

        let hosts = root
            .find_all("source/host")
            .into_iter()
            .filter_map(|h| {
                h.attr("name").map(|name| RbdHost {
                    name: name.to_owned(),
                    port: h.attr("port").map(str::to_owned),
                })
            })
            .collect();

        let auth = root
            .find_all("source/auth")
            .into_iter()
            .find(|a| a.attr("type") == Some("ceph"))
            .and_then(|a| {
                let username = a.attr("username")?;
                let secret_uuid = a.child("secret")?.attr("uuid")?;
                Some(RbdAuth {
                    username: username.to_owned(),
                    secret_uuid: secret_uuid.to_owned(),
                })
            });

        Ok(PoolInfo {
            name: pool.to_owned(),
            backend,
            target_path: text_of("target/path"),
            source_name: text_of("source/name"),
            hosts,
            auth,
        })
    }
}

/// Connection parameters written straight into a domain disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InlineSource {
    File {
        path: String,
    },
    Block {
        dev: String,
    },
    Rbd {
        name: String,
        hosts: Vec<RbdHost>,
        auth: Option<RbdAuth>,
    },
}

/// How a domain disk finds its storage: exactly one of a pool reference or
/// inlined connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DiskSource {
    Volume { pool: String, volume: String },
    Inline(InlineSource),
}

/// A volume to be created before the domain is defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VolumeRequest {
    pub(crate) pool: String,
    pub(crate) name: String,
    /// Capacity in bytes, already aligned to 1 MiB
    pub(crate) capacity: u64,
    pub(crate) clone_from: Option<CloneSource>,
    /// Set when the clone source is smaller than `capacity`.
    pub(crate) grow_after_clone: bool,
}

impl VolumeRequest {
    /// The `<volume>` document for `vol-create` / `vol-create-from`.
    pub(crate) fn to_xml(&self) -> Result<String> {
        let mut volume = Element::new("volume").with_child(Element::new("name").with_text(&self.name));
        // A clone takes its capacity from the source volume.
        if self.clone_from.is_none() {
            volume.push(
                Element::new("capacity")
                    .with_attr("unit", "bytes")
                    .with_text(self.capacity.to_string()),
            );
            volume.push(
                Element::new("allocation")
                    .with_attr("unit", "bytes")
                    .with_text(self.capacity.to_string()),
            );
        }
        volume.to_xml().map_err(Error::Template)
    }
}

/// A resolved disk together with its placement and creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttachedDisk {
    pub(crate) disk: ResolvedDisk,
    pub(crate) source: DiskSource,
    pub(crate) request: VolumeRequest,
}

/// Read-only planning against the daemon; nothing is created here.
pub(crate) struct StoragePlanner<'a> {
    libvirt: &'a dyn Libvirt,
    capabilities: &'a CapabilityTable,
}

impl std::fmt::Debug for StoragePlanner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePlanner")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl<'a> StoragePlanner<'a> {
    pub(crate) fn new(libvirt: &'a dyn Libvirt, capabilities: &'a CapabilityTable) -> Self {
        Self {
            libvirt,
            capabilities,
        }
    }

    pub(crate) fn attach(&self, disk: ResolvedDisk) -> Result<AttachedDisk> {
        let pool = PoolInfo::parse(&disk.pool, &self.libvirt.pool_xml(&disk.pool)?)?;

        if self
            .libvirt
            .list_volumes(&disk.pool)?
            .iter()
            .any(|v| *v == disk.volume)
        {
            return Err(Error::AlreadyExists {
                pool: disk.pool.clone(),
                volume: disk.volume.clone(),
            });
        }

        let requested = disk
            .size
            .ok_or_else(|| Error::validation(format!("disk {} has no size", disk.volume)))?;
        let capacity = align_up(requested, MIB).ok_or_else(|| {
            Error::validation(format!(
                "disk {} size {requested} is too large to round up to 1MiB",
                disk.volume
            ))
        })?;
        if capacity != requested {
            debug!(
                "Padding volume {} from {requested} to {capacity} bytes for 1MiB alignment",
                disk.volume
            );
        }

        let mut grow_after_clone = false;
        if let Some(src) = &disk.source {
            let source_capacity = self.volume_capacity(&src.pool, &src.volume)?;
            if source_capacity > capacity {
                return Err(Error::validation(format!(
                    "source volume {} size {source_capacity} is larger than the target size {capacity} of {}",
                    src.volume, disk.volume
                )));
            }
            grow_after_clone = source_capacity < capacity;
        }

        let source = self.placement(&pool, &disk.volume)?;
        debug!("Disk {} will be attached as {source:?}", disk.volume);

        let request = VolumeRequest {
            pool: disk.pool.clone(),
            name: disk.volume.clone(),
            capacity,
            clone_from: disk.source.clone(),
            grow_after_clone,
        };
        Ok(AttachedDisk {
            disk,
            source,
            request,
        })
    }

    fn placement(&self, pool: &PoolInfo, volume: &str) -> Result<DiskSource> {
        let cap = self.capabilities.get(pool.backend);
        if cap.supports_reference {
            return Ok(DiskSource::Volume {
                pool: pool.name.clone(),
                volume: volume.to_owned(),
            });
        }

        let inline = match cap.connection {
            ConnectionShape::File | ConnectionShape::Block => {
                let dir = pool.target_path.as_deref().ok_or_else(|| {
                    Error::capability(&pool.name, "pool has no target path to inline")
                })?;
                let path = format!("{}/{volume}", dir.trim_end_matches('/'));
                if cap.connection == ConnectionShape::File {
                    InlineSource::File { path }
                } else {
                    InlineSource::Block { dev: path }
                }
            }
            ConnectionShape::Rbd => {
                let ceph_pool = pool.source_name.as_deref().ok_or_else(|| {
                    Error::capability(&pool.name, "rbd pool has no source name")
                })?;
                InlineSource::Rbd {
                    name: format!("{ceph_pool}/{volume}"),
                    hosts: pool.hosts.clone(),
                    auth: pool.auth.clone(),
                }
            }
        };
        Ok(DiskSource::Inline(inline))
    }

    fn volume_capacity(&self, pool: &str, volume: &str) -> Result<u64> {
        let xml = self.libvirt.volume_xml(pool, volume)?;
        let bad = |reason: &str| {
            Error::validation(format!("volume {volume} in pool {pool}: {reason}"))
        };
        let root = Element::parse(&xml).map_err(|e| bad(&e.to_string()))?;
        let capacity = root.child("capacity").ok_or_else(|| bad("no capacity"))?;
        let value = capacity.text().unwrap_or_default();
        match capacity.attr("unit") {
            None | Some("bytes") | Some("B") => value
                .trim()
                .parse()
                .map_err(|_| bad("unreadable capacity")),
            Some(unit) => parse_size(&format!("{}{unit}", value.trim())),
        }
    }
}
