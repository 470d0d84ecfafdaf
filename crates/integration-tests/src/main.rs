use std::path::Path;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

mod tests {
    pub mod cli;
    pub mod create;
}

/// Path to the binary under test: LIBVIRT_INSTANCE_PATH, falling back to
/// "libvirt-instance" from PATH
pub(crate) fn get_instance_command() -> Result<String> {
    if let Ok(path) = std::env::var("LIBVIRT_INSTANCE_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = [
        "target/debug/libvirt-instance",
        "target/release/libvirt-instance",
    ]
    .into_iter()
    .find(|p| Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set LIBVIRT_INSTANCE_PATH={path} to run using this binary"
        ));
    }
    Ok("libvirt-instance".to_owned())
}

fn main() {
    let args = Arguments::from_args();

    let tests = vec![
        Trial::test("version", || {
            tests::cli::test_version()?;
            Ok(())
        }),
        Trial::test("get_config_builtin", || {
            tests::cli::test_get_config_builtin()?;
            Ok(())
        }),
        Trial::test("get_domain_presets_user_override", || {
            tests::cli::test_get_domain_presets_user_override()?;
            Ok(())
        }),
        Trial::test("get_domain_presets_table", || {
            tests::cli::test_get_domain_presets_table()?;
            Ok(())
        }),
        Trial::test("invalid_config_file", || {
            tests::cli::test_invalid_config_file()?;
            Ok(())
        }),
        Trial::test("create_invalid_disk_spec", || {
            tests::create::test_create_invalid_disk_spec()?;
            Ok(())
        }),
        Trial::test("create_unknown_preset", || {
            tests::create::test_create_unknown_preset()?;
            Ok(())
        }),
        Trial::test("create_user_data_requires_seed_disk", || {
            tests::create::test_create_user_data_requires_seed_disk()?;
            Ok(())
        }),
        Trial::test("create_zero_vcpu", || {
            tests::create::test_create_zero_vcpu()?;
            Ok(())
        }),
    ];

    libtest_mimic::run(&args, tests).exit();
}
