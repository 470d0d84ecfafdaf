//! Machine readable and human readable command output.

use std::collections::BTreeMap;

use color_eyre::Result;
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use crate::config::PresetTable;
use crate::create::CreateOutput;

/// Used when a domain preset does not pin an architecture.
const UNSPECIFIED_ARCH: &str = "unspecified";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum OutputFormat {
    /// Indented JSON with sorted keys
    #[default]
    Json,
    /// A human readable table
    Table,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct DomainPresetSummary {
    pub(crate) preset_name: String,
    pub(crate) machine_type: Option<String>,
}

/// Domain presets grouped by architecture.
pub(crate) fn domain_presets(presets: &PresetTable) -> BTreeMap<String, Vec<DomainPresetSummary>> {
    let mut grouped: BTreeMap<String, Vec<DomainPresetSummary>> = BTreeMap::new();
    for (name, preset) in &presets.domain {
        let arch = preset
            .arch_name
            .clone()
            .unwrap_or_else(|| UNSPECIFIED_ARCH.to_owned());
        grouped.entry(arch).or_default().push(DomainPresetSummary {
            preset_name: name.clone(),
            machine_type: preset.machine_type.clone(),
        });
    }
    grouped
}

pub(crate) fn domain_presets_table(grouped: &BTreeMap<String, Vec<DomainPresetSummary>>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["ARCH", "PRESET", "MACHINE TYPE"]);
    for (arch, presets) in grouped {
        for p in presets {
            table.add_row(vec![
                arch.as_str(),
                p.preset_name.as_str(),
                p.machine_type.as_deref().unwrap_or("-"),
            ]);
        }
    }
    table
}

pub(crate) fn create_table(result: &CreateOutput) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["FIELD", "VALUE"]);
    table.add_row(vec!["instance-id", result.instance_id.as_str()]);
    for volume in &result.volumes {
        table.add_row(vec!["volume", volume.as_str()]);
    }
    table
}

/// Serialize as indented JSON. Going through [`serde_json::Value`] sorts
/// object keys.
pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string_pretty(&value)?)
}
