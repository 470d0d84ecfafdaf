use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod arch;
mod config;
mod create;
mod disk;
mod domain;
mod error;
mod interface;
mod iso9660;
mod libvirt;
#[cfg(test)]
mod mock;
mod output;
mod seed;
mod spec;
mod storage;
mod utils;
mod vm;
mod xml;

use config::{Config, DEFAULT_CONFIG_PATH};
use libvirt::{Virsh, DEFAULT_CONNECT_URI};
use output::OutputFormat;

/// Create libvirt domains from presets.
///
/// Domain, disk and interface presets from the config file are combined
/// with per-invocation overrides into a domain definition, its storage
/// volumes and an optional cloud-init seed disk.
#[derive(Parser)]
#[command(name = "libvirt-instance")]
struct Cli {
    /// Configuration file; built-in presets only when it does not exist
    #[clap(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config_file: Utf8PathBuf,

    /// Hypervisor connection URI (e.g., qemu:///system, qemu+ssh://host/system)
    #[clap(short = 'c', long = "connect", global = true, default_value = DEFAULT_CONNECT_URI)]
    connect: String,

    /// Output format for machine readable results
    #[clap(long, global = true, value_enum, default_value_t)]
    output_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the program version
    Version,

    /// List domain presets grouped by architecture
    GetDomainPresets,

    /// Print the effective configuration as YAML
    GetConfig,

    /// Create volumes and define a new domain
    Create(create::CreateOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs go to stderr, filtered by RUST_LOG, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
        Commands::GetDomainPresets => {
            let config = Config::load(&cli.config_file)?;
            let grouped = output::domain_presets(&config.presets);
            match cli.output_format {
                OutputFormat::Json => println!("{}", output::to_json(&grouped)?),
                OutputFormat::Table => println!("{}", output::domain_presets_table(&grouped)),
            }
        }
        Commands::GetConfig => {
            let config = Config::load(&cli.config_file)?;
            print!("{}", config.to_yaml()?);
        }
        Commands::Create(opts) => {
            let config = Config::load(&cli.config_file)?;
            let virsh = Virsh::new(cli.connect);
            let result = create::run(&opts, &config, &virsh)?;
            match cli.output_format {
                OutputFormat::Json => println!("{}", output::to_json(&result)?),
                OutputFormat::Table => println!("{}", output::create_table(&result)),
            }
        }
    }
    Ok(())
}
