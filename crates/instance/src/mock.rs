//! In-memory libvirt used by unit tests: three pools (dir, logical, rbd)
//! and an x86_64 host.

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::libvirt::Libvirt;
use crate::xml::Element;

const DEFAULT_POOL_XML: &str = r#"
<pool type='dir'>
  <name>default</name>
  <uuid>398b704a-9128-4c0d-9156-d97578ed19ec</uuid>
  <capacity unit='bytes'>17152606208</capacity>
  <allocation unit='bytes'>7409659904</allocation>
  <available unit='bytes'>9742946304</available>
  <source>
  </source>
  <target>
    <path>/var/lib/libvirt/images</path>
    <permissions>
      <mode>0755</mode>
      <owner>0</owner>
      <group>0</group>
    </permissions>
  </target>
</pool>"#;

const LOGICAL_POOL_XML: &str = r#"
<pool type='logical'>
  <name>logical</name>
  <uuid>cfbf8539-b6e4-46cd-a389-fc0afc2dd089</uuid>
  <source>
    <name>scratch</name>
    <format type='lvm2'/>
  </source>
  <target>
    <path>/dev/scratch</path>
  </target>
</pool>"#;

const CEPH_POOL_XML: &str = r#"
<pool type='rbd'>
  <name>ceph</name>
  <uuid>20ad2b50-50a9-4423-8eaa-72b481947da9</uuid>
  <source>
    <host name='mon1'/>
    <host name='mon2'/>
    <host name='mon3'/>
    <name>rbd1</name>
    <auth type='ceph' username='libvirt'>
      <secret uuid='89890794-6310-4e93-81a1-0d37d601ab78'/>
    </auth>
  </source>
</pool>"#;

pub(crate) const CAPABILITIES_XML: &str = r#"
<capabilities>
  <host>
    <cpu>
      <arch>x86_64</arch>
    </cpu>
  </host>
  <guest>
    <os_type>hvm</os_type>
    <arch name='x86_64'>
      <wordsize>64</wordsize>
      <emulator>/usr/bin/qemu-system-x86_64</emulator>
      <machine maxCpus='255'>pc-i440fx-6.2</machine>
      <machine canonical='pc-i440fx-6.2' maxCpus='255'>pc</machine>
      <domain type='qemu'>
        <emulator>/usr/bin/qemu</emulator>
        <machine maxCpus='255'>pc-i440fx-6.1</machine>
      </domain>
      <domain type='kvm'>
        <emulator>/usr/bin/qemu-kvm</emulator>
        <machine maxCpus='255'>pc-i440fx-7.0</machine>
      </domain>
    </arch>
    <features>
      <acpi default='on' toggle='yes'/>
      <apic default='on' toggle='no'/>
    </features>
  </guest>
</capabilities>"#;

/// A side-effecting call made against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    CreateVolume {
        pool: String,
        name: String,
        capacity: u64,
    },
    CloneVolume {
        pool: String,
        name: String,
        source_pool: String,
        source: String,
    },
    ResizeVolume {
        pool: String,
        name: String,
        capacity: u64,
    },
    UploadVolume {
        pool: String,
        name: String,
        len: usize,
    },
    DefineDomain(String),
}

#[derive(Debug)]
pub(crate) struct MockLibvirt {
    pools: BTreeMap<&'static str, &'static str>,
    /// pool -> volume -> capacity
    volumes: RefCell<BTreeMap<String, BTreeMap<String, u64>>>,
    uploads: RefCell<BTreeMap<(String, String), Vec<u8>>>,
    calls: RefCell<Vec<Call>>,
}

fn daemon(command: &str, message: String) -> Error {
    Error::Daemon {
        command: command.to_owned(),
        message,
    }
}

impl MockLibvirt {
    pub(crate) fn new() -> Self {
        let pools = BTreeMap::from([
            ("default", DEFAULT_POOL_XML),
            ("logical", LOGICAL_POOL_XML),
            ("ceph", CEPH_POOL_XML),
        ]);
        Self {
            pools,
            volumes: RefCell::new(BTreeMap::new()),
            uploads: RefCell::new(BTreeMap::new()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn add_volume(&self, pool: &str, name: &str, capacity: u64) {
        self.volumes
            .borrow_mut()
            .entry(pool.to_owned())
            .or_default()
            .insert(name.to_owned(), capacity);
    }

    pub(crate) fn volume_capacity(&self, pool: &str, name: &str) -> Option<u64> {
        self.volumes.borrow().get(pool)?.get(name).copied()
    }

    pub(crate) fn uploaded(&self, pool: &str, name: &str) -> Option<Vec<u8>> {
        self.uploads
            .borrow()
            .get(&(pool.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Every call that changed daemon state, in order.
    pub(crate) fn mutating_calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub(crate) fn defined_domains(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::DefineDomain(xml) => Some(xml.clone()),
                _ => None,
            })
            .collect()
    }

    fn check_pool(&self, command: &str, pool: &str) -> Result<()> {
        if self.pools.contains_key(pool) {
            Ok(())
        } else {
            Err(daemon(command, format!("pool {pool} does not exist")))
        }
    }

    fn volume_name(command: &str, xml: &str) -> Result<String> {
        Element::parse(xml)
            .ok()
            .and_then(|v| v.child("name").and_then(|n| n.text()))
            .ok_or_else(|| daemon(command, "volume XML has no name".into()))
    }
}

impl Libvirt for MockLibvirt {
    fn capabilities(&self) -> Result<String> {
        Ok(CAPABILITIES_XML.to_owned())
    }

    fn pool_xml(&self, pool: &str) -> Result<String> {
        self.pools
            .get(pool)
            .map(|xml| xml.to_string())
            .ok_or_else(|| daemon("pool-dumpxml", format!("pool {pool} does not exist")))
    }

    fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        self.check_pool("vol-list", pool)?;
        Ok(self
            .volumes
            .borrow()
            .get(pool)
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn volume_xml(&self, pool: &str, volume: &str) -> Result<String> {
        self.check_pool("vol-dumpxml", pool)?;
        let capacity = self
            .volume_capacity(pool, volume)
            .ok_or_else(|| daemon("vol-dumpxml", format!("volume {volume} does not exist")))?;
        Ok(format!(
            "<volume type='file'><name>{volume}</name>\
             <capacity unit='bytes'>{capacity}</capacity>\
             <allocation unit='bytes'>{capacity}</allocation></volume>"
        ))
    }

    fn create_volume(&self, pool: &str, xml: &str) -> Result<()> {
        self.check_pool("vol-create", pool)?;
        let doc = Element::parse(xml).map_err(|e| daemon("vol-create", e.to_string()))?;
        let name = Self::volume_name("vol-create", xml)?;
        let capacity = doc
            .child("capacity")
            .and_then(|c| c.text())
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| daemon("vol-create", "volume XML has no capacity".into()))?;
        if self.volume_capacity(pool, &name).is_some() {
            return Err(daemon("vol-create", format!("volume {name} already exists")));
        }
        self.add_volume(pool, &name, capacity);
        self.calls.borrow_mut().push(Call::CreateVolume {
            pool: pool.to_owned(),
            name,
            capacity,
        });
        Ok(())
    }

    fn clone_volume(&self, pool: &str, xml: &str, source_pool: &str, source: &str) -> Result<()> {
        self.check_pool("vol-create-from", pool)?;
        let name = Self::volume_name("vol-create-from", xml)?;
        let capacity = self.volume_capacity(source_pool, source).ok_or_else(|| {
            daemon("vol-create-from", format!("volume {source} does not exist"))
        })?;
        if self.volume_capacity(pool, &name).is_some() {
            return Err(daemon("vol-create-from", format!("volume {name} already exists")));
        }
        self.add_volume(pool, &name, capacity);
        self.calls.borrow_mut().push(Call::CloneVolume {
            pool: pool.to_owned(),
            name,
            source_pool: source_pool.to_owned(),
            source: source.to_owned(),
        });
        Ok(())
    }

    fn resize_volume(&self, pool: &str, volume: &str, capacity: u64) -> Result<()> {
        if self.volume_capacity(pool, volume).is_none() {
            return Err(daemon("vol-resize", format!("volume {volume} does not exist")));
        }
        self.add_volume(pool, volume, capacity);
        self.calls.borrow_mut().push(Call::ResizeVolume {
            pool: pool.to_owned(),
            name: volume.to_owned(),
            capacity,
        });
        Ok(())
    }

    fn upload_volume(&self, pool: &str, volume: &str, data: &[u8]) -> Result<()> {
        let capacity = self
            .volume_capacity(pool, volume)
            .ok_or_else(|| daemon("vol-upload", format!("volume {volume} does not exist")))?;
        if data.len() as u64 > capacity {
            return Err(daemon("vol-upload", "data larger than the volume".into()));
        }
        self.uploads
            .borrow_mut()
            .insert((pool.to_owned(), volume.to_owned()), data.to_vec());
        self.calls.borrow_mut().push(Call::UploadVolume {
            pool: pool.to_owned(),
            name: volume.to_owned(),
            len: data.len(),
        });
        Ok(())
    }

    fn define_domain(&self, xml: &str) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(Call::DefineDomain(xml.to_owned()));
        Ok(())
    }
}
