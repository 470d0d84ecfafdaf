//! Parsing of the comma-separated `--disk`, `--nic` and `--cloud-seed-disk`
//! values: `preset-name[,size],key=value,...`.

use crate::error::{Error, Result};
use crate::utils::parse_size;

/// Per-invocation disk overrides; `None` means "use the preset's value".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DiskOverrides {
    pub(crate) pool: Option<String>,
    pub(crate) bus: Option<String>,
    pub(crate) cache: Option<String>,
    pub(crate) source: Option<String>,
    pub(crate) source_pool: Option<String>,
    pub(crate) boot_order: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiskSpec {
    pub(crate) preset: String,
    /// Requested size in bytes; always set for `--disk`, never for the seed
    /// disk.
    pub(crate) size: Option<u64>,
    pub(crate) overrides: DiskOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct InterfaceOverrides {
    pub(crate) mac_address: Option<String>,
    pub(crate) model_type: Option<String>,
    pub(crate) network: Option<String>,
    pub(crate) bridge: Option<String>,
    pub(crate) mtu: Option<u32>,
    pub(crate) boot_order: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InterfaceSpec {
    pub(crate) preset: String,
    pub(crate) overrides: InterfaceOverrides,
}

/// A spec split into its positional values and `key=value` pairs, both in
/// the order written.
#[derive(Debug, Default, PartialEq, Eq)]
struct RawSpec<'a> {
    positional: Vec<&'a str>,
    pairs: Vec<(&'a str, &'a str)>,
}

fn parse_spec(raw: &str) -> Result<RawSpec<'_>> {
    let mut spec = RawSpec::default();
    if raw.is_empty() {
        return Ok(spec);
    }
    for item in raw.split(',') {
        match item.split_once('=') {
            None => spec.positional.push(item),
            Some((key, value)) => {
                if spec.pairs.iter().any(|(k, _)| *k == key) {
                    return Err(Error::parse(raw, format!("duplicate key '{key}'")));
                }
                spec.pairs.push((key, value));
            }
        }
    }
    Ok(spec)
}

fn preset_name<'a>(raw: &str, positional: &[&'a str]) -> Result<&'a str> {
    match positional.first() {
        Some(name) if !name.is_empty() => Ok(*name),
        _ => Err(Error::parse(raw, "missing preset name")),
    }
}

fn positive_int(raw: &str, key: &str, value: &str) -> Result<u32> {
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::parse(
            raw,
            format!("{key} must be a positive integer, got '{value}'"),
        )),
    }
}

fn non_empty(raw: &str, key: &str, value: &str) -> Result<String> {
    if value.is_empty() {
        return Err(Error::parse(raw, format!("empty value for '{key}'")));
    }
    Ok(value.to_owned())
}

fn unknown_key(raw: &str, key: &str, allowed: &[&str]) -> Error {
    Error::parse(
        raw,
        format!("unknown key '{key}'; allowed keys: {}", allowed.join(", ")),
    )
}

/// Parse `preset,size[,key=value...]`.
pub(crate) fn parse_disk_spec(raw: &str) -> Result<DiskSpec> {
    const ALLOWED: &[&str] = &["pool", "bus", "cache", "source", "source-pool", "boot-order"];

    let spec = parse_spec(raw)?;
    let preset = preset_name(raw, &spec.positional)?;
    let size = match spec.positional.as_slice() {
        [_, size] => parse_size(size).map_err(|e| Error::parse(raw, e.to_string()))?,
        [_] => return Err(Error::parse(raw, "missing disk size")),
        _ => {
            return Err(Error::parse(
                raw,
                "expected a preset name and a size followed by key=value pairs",
            ))
        }
    };

    let mut overrides = DiskOverrides::default();
    for (key, value) in spec.pairs {
        match key {
            "pool" => overrides.pool = Some(non_empty(raw, key, value)?),
            "bus" => overrides.bus = Some(non_empty(raw, key, value)?),
            "cache" => overrides.cache = Some(non_empty(raw, key, value)?),
            "source" => overrides.source = Some(non_empty(raw, key, value)?),
            "source-pool" => overrides.source_pool = Some(non_empty(raw, key, value)?),
            "boot-order" => overrides.boot_order = Some(positive_int(raw, key, value)?),
            _ => return Err(unknown_key(raw, key, ALLOWED)),
        }
    }

    Ok(DiskSpec {
        preset: preset.to_owned(),
        size: Some(size),
        overrides,
    })
}

/// Parse `preset[,key=value...]` for the cloud-init seed disk. Its size is
/// decided by the image contents.
pub(crate) fn parse_seed_disk_spec(raw: &str) -> Result<DiskSpec> {
    const ALLOWED: &[&str] = &["pool", "bus", "cache"];

    let spec = parse_spec(raw)?;
    let preset = preset_name(raw, &spec.positional)?;
    if spec.positional.len() > 1 {
        return Err(Error::parse(
            raw,
            "the seed disk takes only a preset name followed by key=value pairs",
        ));
    }

    let mut overrides = DiskOverrides::default();
    for (key, value) in spec.pairs {
        match key {
            "pool" => overrides.pool = Some(non_empty(raw, key, value)?),
            "bus" => overrides.bus = Some(non_empty(raw, key, value)?),
            "cache" => overrides.cache = Some(non_empty(raw, key, value)?),
            _ => return Err(unknown_key(raw, key, ALLOWED)),
        }
    }

    Ok(DiskSpec {
        preset: preset.to_owned(),
        size: None,
        overrides,
    })
}

/// Parse `preset[,key=value...]` for a network interface.
pub(crate) fn parse_interface_spec(raw: &str) -> Result<InterfaceSpec> {
    const ALLOWED: &[&str] = &["mac-address", "model-type", "network", "bridge", "mtu", "boot-order"];

    let spec = parse_spec(raw)?;
    let preset = preset_name(raw, &spec.positional)?;
    if spec.positional.len() > 1 {
        return Err(Error::parse(
            raw,
            "expected a preset name followed by key=value pairs",
        ));
    }

    let mut overrides = InterfaceOverrides::default();
    for (key, value) in spec.pairs {
        match key {
            "mac-address" => overrides.mac_address = Some(non_empty(raw, key, value)?),
            "model-type" => overrides.model_type = Some(non_empty(raw, key, value)?),
            "network" => overrides.network = Some(non_empty(raw, key, value)?),
            "bridge" => overrides.bridge = Some(non_empty(raw, key, value)?),
            "mtu" => overrides.mtu = Some(positive_int(raw, key, value)?),
            "boot-order" => overrides.boot_order = Some(positive_int(raw, key, value)?),
            _ => return Err(unknown_key(raw, key, ALLOWED)),
        }
    }

    Ok(InterfaceSpec {
        preset: preset.to_owned(),
        overrides,
    })
}
