//! Layered configuration: built-in defaults and presets, overlaid by the
//! user's YAML config file.
//!
//! Presets are replaced wholesale: a user preset with the same kind and
//! name as a built-in one hides it completely. The `defaults` section is
//! merged key by key.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;
use yaml_rust2::{yaml, Yaml, YamlEmitter, YamlLoader};

use crate::error::{Error, Result};
use crate::storage::{CapabilityTable, PoolBackend};

pub(crate) const DEFAULT_CONFIG_PATH: &str = "/etc/libvirt-instance-config.yaml";

const HEADLESS_X86_64_XML: &str = include_str!("domain-presets/headless-server-x86_64.xml");
const HEADLESS_AARCH64_XML: &str = include_str!("domain-presets/headless-server-aarch64.xml");

/// The three kinds of named presets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum PresetKind {
    Domain,
    Disk,
    Interface,
}

/// Fallbacks for `create` flags that were not given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Defaults {
    pub(crate) cpu_model: Option<String>,
    pub(crate) domain_type: Option<String>,
    pub(crate) domain_preset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TemplateSource {
    Inline(String),
    File(Utf8PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DomainPreset {
    pub(crate) arch_name: Option<String>,
    pub(crate) machine_type: Option<String>,
    pub(crate) template: Option<TemplateSource>,
}

impl DomainPreset {
    /// The base template text, reading `xml-file` presets from disk.
    pub(crate) fn template_text(&self) -> Result<Option<String>> {
        match &self.template {
            None => Ok(None),
            Some(TemplateSource::Inline(xml)) => Ok(Some(xml.clone())),
            Some(TemplateSource::File(path)) => {
                debug!("Reading domain template {path}");
                std::fs::read_to_string(path)
                    .map(Some)
                    .map_err(|e| Error::Config(format!("reading xml-file {path}: {e}")))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DiskPreset {
    pub(crate) kind: Option<String>,
    pub(crate) pool: Option<String>,
    pub(crate) bus: Option<String>,
    pub(crate) cache: Option<String>,
    pub(crate) source: Option<String>,
    pub(crate) source_pool: Option<String>,
    pub(crate) boot_order: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct InterfacePreset {
    pub(crate) kind: Option<String>,
    pub(crate) model_type: Option<String>,
    pub(crate) network: Option<String>,
    pub(crate) bridge: Option<String>,
    pub(crate) mac_address: Option<String>,
    pub(crate) mtu: Option<u32>,
    pub(crate) boot_order: Option<u32>,
}

/// All presets, keyed by name within each kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PresetTable {
    pub(crate) domain: BTreeMap<String, DomainPreset>,
    pub(crate) disk: BTreeMap<String, DiskPreset>,
    pub(crate) interface: BTreeMap<String, InterfacePreset>,
}

impl PresetTable {
    fn builtin() -> Self {
        let mut table = Self::default();
        table.domain.insert(
            "headless-server-x86_64".into(),
            DomainPreset {
                arch_name: Some("x86_64".into()),
                machine_type: Some("pc".into()),
                template: Some(TemplateSource::Inline(HEADLESS_X86_64_XML.into())),
            },
        );
        table.domain.insert(
            "headless-server-aarch64".into(),
            DomainPreset {
                arch_name: Some("aarch64".into()),
                machine_type: Some("virt".into()),
                template: Some(TemplateSource::Inline(HEADLESS_AARCH64_XML.into())),
            },
        );
        table
    }

    /// Overlay `user` on `builtin`, replacing whole presets by name.
    pub(crate) fn merge(mut builtin: PresetTable, user: PresetTable) -> PresetTable {
        builtin.domain.extend(user.domain);
        builtin.disk.extend(user.disk);
        builtin.interface.extend(user.interface);
        builtin
    }

    pub(crate) fn domain(&self, name: &str) -> Result<&DomainPreset> {
        self.domain.get(name).ok_or_else(|| not_found(PresetKind::Domain, name))
    }

    pub(crate) fn disk(&self, name: &str) -> Result<&DiskPreset> {
        self.disk.get(name).ok_or_else(|| not_found(PresetKind::Disk, name))
    }

    pub(crate) fn interface(&self, name: &str) -> Result<&InterfacePreset> {
        self.interface
            .get(name)
            .ok_or_else(|| not_found(PresetKind::Interface, name))
    }
}

fn not_found(kind: PresetKind, name: &str) -> Error {
    Error::NotFound {
        kind,
        name: name.to_owned(),
    }
}

/// The effective configuration for one invocation.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) defaults: Defaults,
    pub(crate) presets: PresetTable,
    pub(crate) capabilities: CapabilityTable,
}

impl Config {
    pub(crate) fn builtin() -> Self {
        Self {
            defaults: Defaults {
                domain_type: Some("kvm".into()),
                ..Default::default()
            },
            presets: PresetTable::builtin(),
            capabilities: CapabilityTable::default(),
        }
    }

    /// Load the config file at `path`; a missing file means built-ins only.
    pub(crate) fn load(path: &Utf8Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {path} not found, using built-in configuration");
            return Ok(Self::builtin());
        }
        debug!("Loading config file {path}");
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {path}: {e}")))?;
        Self::from_yaml(&text)
    }

    /// Built-in configuration overlaid with the YAML document `text`.
    pub(crate) fn from_yaml(text: &str) -> Result<Self> {
        let docs = YamlLoader::load_from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        let mut config = Self::builtin();
        let Some(doc) = docs.into_iter().next() else {
            return Ok(config);
        };
        let root = match doc {
            Yaml::Hash(h) => h,
            Yaml::Null => return Ok(config),
            _ => return Err(Error::Config("top level must be a mapping".into())),
        };

        for (key, value) in &root {
            match key_str(key)? {
                "defaults" => config.defaults.apply(value)?,
                "preset" => {
                    let user = parse_presets(value)?;
                    config.presets = PresetTable::merge(config.presets, user);
                }
                "pool-capabilities" => config.capabilities.apply_overrides(&parse_capabilities(value)?),
                other => return Err(Error::Config(format!("unknown top-level key '{other}'"))),
            }
        }
        Ok(config)
    }

    /// The merged configuration as YAML, keys sorted, templates as block
    /// scalars.
    pub(crate) fn to_yaml(&self) -> Result<String> {
        let mut root = BTreeMap::new();
        root.insert("defaults", self.defaults.to_yaml());
        root.insert("pool-capabilities", self.capabilities.to_yaml());
        root.insert("preset", self.presets.to_yaml());

        let mut out = String::new();
        let mut emitter = YamlEmitter::new(&mut out);
        emitter.multiline_strings(true);
        emitter
            .dump(&hash(root))
            .map_err(|e| Error::Config(format!("emitting YAML: {e}")))?;
        out.push('\n');
        Ok(out)
    }
}

impl Defaults {
    fn apply(&mut self, value: &Yaml) -> Result<()> {
        for (key, value) in mapping(value, "defaults")? {
            let key = key_str(key)?;
            let value = scalar(value, key)?;
            match key {
                "cpu-model" => self.cpu_model = value,
                "domain-type" => self.domain_type = value,
                "domain-preset" => self.domain_preset = value,
                other => return Err(Error::validation(format!("unknown key '{other}' in defaults"))),
            }
        }
        Ok(())
    }

    fn to_yaml(&self) -> Yaml {
        let mut m = BTreeMap::new();
        m.insert("cpu-model", opt_str(&self.cpu_model));
        m.insert("domain-preset", opt_str(&self.domain_preset));
        m.insert("domain-type", opt_str(&self.domain_type));
        hash(m)
    }
}

fn parse_presets(value: &Yaml) -> Result<PresetTable> {
    let mut table = PresetTable::default();
    for (kind, presets) in mapping(value, "preset")? {
        let kind_name = key_str(kind)?;
        let kind: PresetKind = kind_name
            .parse()
            .map_err(|_| Error::Config(format!("unsupported preset kind '{kind_name}'")))?;
        for (name, body) in mapping(presets, kind_name)? {
            let name = key_str(name)?.to_owned();
            let ctx = format!("{kind}/{name}");
            match kind {
                PresetKind::Domain => {
                    table.domain.insert(name, parse_domain_preset(body, &ctx)?);
                }
                PresetKind::Disk => {
                    table.disk.insert(name, parse_disk_preset(body, &ctx)?);
                }
                PresetKind::Interface => {
                    table
                        .interface
                        .insert(name, parse_interface_preset(body, &ctx)?);
                }
            }
        }
    }
    Ok(table)
}

fn parse_domain_preset(body: &Yaml, ctx: &str) -> Result<DomainPreset> {
    let mut preset = DomainPreset::default();
    let mut xml = None;
    let mut xml_file = None;
    for (key, value) in mapping(body, ctx)? {
        match key_str(key)? {
            "arch-name" => preset.arch_name = scalar(value, ctx)?,
            "machine-type" => preset.machine_type = scalar(value, ctx)?,
            "xml" => xml = scalar(value, ctx)?,
            "xml-file" => xml_file = scalar(value, ctx)?,
            other => return Err(unknown_key(ctx, other)),
        }
    }
    preset.template = match (xml, xml_file) {
        (Some(_), Some(_)) => {
            return Err(Error::validation(format!(
                "preset {ctx}: xml and xml-file are mutually exclusive"
            )))
        }
        (Some(xml), None) => Some(TemplateSource::Inline(xml)),
        (None, Some(path)) => Some(TemplateSource::File(path.into())),
        (None, None) => None,
    };
    Ok(preset)
}

fn parse_disk_preset(body: &Yaml, ctx: &str) -> Result<DiskPreset> {
    let mut preset = DiskPreset::default();
    for (key, value) in mapping(body, ctx)? {
        match key_str(key)? {
            "type" => preset.kind = scalar(value, ctx)?,
            "pool" => preset.pool = scalar(value, ctx)?,
            "bus" => preset.bus = scalar(value, ctx)?,
            "cache" => preset.cache = scalar(value, ctx)?,
            "source" => preset.source = scalar(value, ctx)?,
            "source-pool" => preset.source_pool = scalar(value, ctx)?,
            "boot-order" => preset.boot_order = positive(value, ctx, "boot-order")?,
            other => return Err(unknown_key(ctx, other)),
        }
    }
    Ok(preset)
}

fn parse_interface_preset(body: &Yaml, ctx: &str) -> Result<InterfacePreset> {
    let mut preset = InterfacePreset::default();
    for (key, value) in mapping(body, ctx)? {
        match key_str(key)? {
            "type" => preset.kind = scalar(value, ctx)?,
            "model-type" => preset.model_type = scalar(value, ctx)?,
            "network" => preset.network = scalar(value, ctx)?,
            "bridge" => preset.bridge = scalar(value, ctx)?,
            "mac-address" => preset.mac_address = scalar(value, ctx)?,
            "mtu" => preset.mtu = positive(value, ctx, "mtu")?,
            "boot-order" => preset.boot_order = positive(value, ctx, "boot-order")?,
            other => return Err(unknown_key(ctx, other)),
        }
    }
    Ok(preset)
}

fn parse_capabilities(value: &Yaml) -> Result<Vec<(PoolBackend, bool)>> {
    let mut overrides = Vec::new();
    for (backend, body) in mapping(value, "pool-capabilities")? {
        let name = key_str(backend)?;
        let backend: PoolBackend = name
            .parse()
            .map_err(|_| Error::Config(format!("unknown pool type '{name}' in pool-capabilities")))?;
        for (key, value) in mapping(body, name)? {
            match (key_str(key)?, value) {
                ("supports-reference", Yaml::Boolean(b)) => overrides.push((backend, *b)),
                ("supports-reference", _) => {
                    return Err(Error::validation(format!(
                        "pool-capabilities/{name}: supports-reference must be a boolean"
                    )))
                }
                (other, _) => return Err(unknown_key(&format!("pool-capabilities/{name}"), other)),
            }
        }
    }
    Ok(overrides)
}

impl PresetTable {
    fn to_yaml(&self) -> Yaml {
        let domain = self
            .domain
            .iter()
            .map(|(name, p)| {
                let mut m = BTreeMap::new();
                insert_opt(&mut m, "arch-name", &p.arch_name);
                insert_opt(&mut m, "machine-type", &p.machine_type);
                match &p.template {
                    Some(TemplateSource::Inline(xml)) => {
                        m.insert("xml", Yaml::String(xml.clone()));
                    }
                    Some(TemplateSource::File(path)) => {
                        m.insert("xml-file", Yaml::String(path.to_string()));
                    }
                    None => {}
                }
                (name.as_str(), hash(m))
            })
            .collect();
        let disk = self
            .disk
            .iter()
            .map(|(name, p)| {
                let mut m = BTreeMap::new();
                insert_opt(&mut m, "type", &p.kind);
                insert_opt(&mut m, "pool", &p.pool);
                insert_opt(&mut m, "bus", &p.bus);
                insert_opt(&mut m, "cache", &p.cache);
                insert_opt(&mut m, "source", &p.source);
                insert_opt(&mut m, "source-pool", &p.source_pool);
                insert_int(&mut m, "boot-order", p.boot_order);
                (name.as_str(), hash(m))
            })
            .collect();
        let interface = self
            .interface
            .iter()
            .map(|(name, p)| {
                let mut m = BTreeMap::new();
                insert_opt(&mut m, "type", &p.kind);
                insert_opt(&mut m, "model-type", &p.model_type);
                insert_opt(&mut m, "network", &p.network);
                insert_opt(&mut m, "bridge", &p.bridge);
                insert_opt(&mut m, "mac-address", &p.mac_address);
                insert_int(&mut m, "mtu", p.mtu);
                insert_int(&mut m, "boot-order", p.boot_order);
                (name.as_str(), hash(m))
            })
            .collect();

        let mut m = BTreeMap::new();
        m.insert("disk", hash(disk));
        m.insert("domain", hash(domain));
        m.insert("interface", hash(interface));
        hash(m)
    }
}

pub(crate) fn hash(entries: BTreeMap<&str, Yaml>) -> Yaml {
    let mut h = yaml::Hash::new();
    for (k, v) in entries {
        h.insert(Yaml::String(k.to_owned()), v);
    }
    Yaml::Hash(h)
}

fn opt_str(value: &Option<String>) -> Yaml {
    value.clone().map(Yaml::String).unwrap_or(Yaml::Null)
}

fn insert_opt<'a>(m: &mut BTreeMap<&'a str, Yaml>, key: &'a str, value: &Option<String>) {
    if let Some(v) = value {
        m.insert(key, Yaml::String(v.clone()));
    }
}

fn insert_int<'a>(m: &mut BTreeMap<&'a str, Yaml>, key: &'a str, value: Option<u32>) {
    if let Some(v) = value {
        m.insert(key, Yaml::Integer(v.into()));
    }
}

fn mapping<'a>(value: &'a Yaml, ctx: &str) -> Result<Vec<(&'a Yaml, &'a Yaml)>> {
    match value {
        Yaml::Hash(h) => Ok(h.iter().collect()),
        Yaml::Null => Ok(Vec::new()),
        _ => Err(Error::Config(format!("{ctx} must be a mapping"))),
    }
}

fn key_str(key: &Yaml) -> Result<&str> {
    key.as_str()
        .ok_or_else(|| Error::Config(format!("mapping keys must be strings, got {key:?}")))
}

fn unknown_key(ctx: &str, key: &str) -> Error {
    Error::validation(format!("unknown key '{key}' in {ctx}"))
}

/// A scalar as a string; integers and booleans are accepted as written.
fn scalar(value: &Yaml, ctx: &str) -> Result<Option<String>> {
    match value {
        Yaml::String(s) | Yaml::Real(s) => Ok(Some(s.clone())),
        Yaml::Integer(i) => Ok(Some(i.to_string())),
        Yaml::Boolean(b) => Ok(Some(b.to_string())),
        Yaml::Null => Ok(None),
        _ => Err(Error::validation(format!("{ctx}: expected a scalar value"))),
    }
}

fn positive(value: &Yaml, ctx: &str, key: &str) -> Result<Option<u32>> {
    let n = match value {
        Yaml::Null => return Ok(None),
        Yaml::Integer(i) => u32::try_from(*i).ok(),
        Yaml::String(s) => s.parse::<u32>().ok(),
        _ => None,
    };
    match n {
        Some(n) if n > 0 => Ok(Some(n)),
        _ => Err(Error::validation(format!(
            "{ctx}: {key} must be a positive integer"
        ))),
    }
}
