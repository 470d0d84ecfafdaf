//! NoCloud seed images for cloud-init.
//!
//! See <https://cloudinit.readthedocs.io/en/latest/reference/datasources/nocloud.html>

use yaml_rust2::{yaml, Yaml, YamlEmitter};

use crate::error::{Error, Result};
use crate::iso9660::IsoBuilder;

/// cloud-init looks for a filesystem with this label.
pub(crate) const SEED_VOLUME_ID: &str = "cidata";

/// The `meta-data` document: instance id and hostname.
pub(crate) fn meta_data_yaml(instance_id: &str, hostname: &str) -> Result<String> {
    let mut v = yaml::Hash::new();
    v.insert(
        Yaml::String("instance-id".into()),
        Yaml::String(instance_id.into()),
    );
    v.insert(
        Yaml::String("local-hostname".into()),
        Yaml::String(hostname.into()),
    );

    let mut out = String::new();
    let mut emitter = YamlEmitter::new(&mut out);
    emitter
        .dump(&Yaml::Hash(v))
        .map_err(|e| Error::Config(format!("emitting meta-data: {e}")))?;
    out.push('\n');
    Ok(out)
}

/// Build the seed ISO. `user-data` is always present (empty when not
/// given); `network-config` only when given.
pub(crate) fn build_seed(
    user_data: Option<&str>,
    network_config: Option<&str>,
    meta_data: &str,
) -> Result<Vec<u8>> {
    let mut iso = IsoBuilder::new(SEED_VOLUME_ID);
    iso.add_file("METADATA.;1", "meta-data", meta_data)?;
    iso.add_file("USERDATA.;1", "user-data", user_data.unwrap_or_default())?;
    if let Some(network_config) = network_config {
        iso.add_file("NETWORK.;1", "network-config", network_config)?;
    }
    iso.build()
}
