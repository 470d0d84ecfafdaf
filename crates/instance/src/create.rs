//! The `create` command: resolve, plan and synthesize everything up front,
//! then create the volumes and define the domain.

use camino::Utf8PathBuf;
use clap::Parser;
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::disk::{resolve_disk, DiskRole, ResolvedDisk};
use crate::domain::{parse_template, template_boot_orders, DomainDefinition, HostCapabilities};
use crate::error::{Error, Result};
use crate::interface::{resolve_interface, ResolvedInterface};
use crate::libvirt::Libvirt;
use crate::seed::{build_seed, meta_data_yaml};
use crate::spec::{parse_disk_spec, parse_interface_spec, parse_seed_disk_spec};
use crate::storage::{AttachedDisk, StoragePlanner};
use crate::utils::parse_size;
use crate::vm::{check_boot_order, requested_boot_orders, VmSpec};
use crate::xml::Element;

fn parse_memory(s: &str) -> std::result::Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

/// Options for creating a new libvirt domain and its volumes
#[derive(Debug, Clone, Parser)]
pub(crate) struct CreateOpts {
    /// Name of the domain; also the prefix of its volume names
    pub(crate) name: String,

    /// Guest memory (e.g. 2GiB, 512MiB); plain numbers are bytes
    #[clap(long, value_parser = parse_memory)]
    pub(crate) memory: u64,

    /// Number of virtual CPUs
    #[clap(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) vcpu: u32,

    /// CPU model to emulate; host CPU passthrough when not set
    #[clap(long)]
    pub(crate) cpu_model: Option<String>,

    /// Guest architecture (overrides the domain preset)
    #[clap(long)]
    pub(crate) arch_name: Option<String>,

    /// Machine type (overrides the domain preset)
    #[clap(long)]
    pub(crate) machine_type: Option<String>,

    /// libvirt domain type, e.g. kvm or qemu
    #[clap(long)]
    pub(crate) domain_type: Option<String>,

    /// Domain preset to base the domain on
    #[clap(long)]
    pub(crate) domain_preset: Option<String>,

    /// Disk spec: "preset-name,size[,key=value...]"; may be repeated
    ///
    /// Keys: pool, bus, cache, source, source-pool, boot-order
    #[clap(long)]
    pub(crate) disk: Vec<String>,

    /// Network interface spec: "preset-name[,key=value...]"; may be repeated
    ///
    /// Keys: mac-address, model-type, network, bridge, mtu, boot-order
    #[clap(long)]
    pub(crate) nic: Vec<String>,

    /// Cloud-init seed disk spec: "preset-name[,key=value...]"
    ///
    /// Keys: pool, bus, cache
    #[clap(long)]
    pub(crate) cloud_seed_disk: Option<String>,

    /// cloud-init user-data file for the seed disk
    #[clap(long, requires = "cloud_seed_disk")]
    pub(crate) cloud_user_data_file: Option<Utf8PathBuf>,

    /// cloud-init network-config file for the seed disk
    #[clap(long, requires = "cloud_seed_disk")]
    pub(crate) cloud_network_config_file: Option<Utf8PathBuf>,

    /// Resolve and validate everything and print the domain XML, but
    /// create nothing
    #[clap(long)]
    pub(crate) dry_run: bool,
}

/// What `create` reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct CreateOutput {
    /// Domain UUID, also the cloud-init instance id
    pub(crate) instance_id: String,
    /// Volume names, in creation order
    pub(crate) volumes: Vec<String>,
}

fn read_cloud_file(path: Option<&Utf8PathBuf>) -> Result<Option<String>> {
    path.map(|p| {
        std::fs::read_to_string(p)
            .map_err(|e| Error::validation(format!("reading {p}: {e}")))
    })
    .transpose()
}

/// Everything decided before the daemon is touched.
#[derive(Debug)]
struct Resolved {
    arch: Option<String>,
    machine_type: String,
    domain_type: String,
    cpu_model: Option<String>,
    template: Option<Element>,
    disks: Vec<ResolvedDisk>,
    seed: Option<(ResolvedDisk, Vec<u8>)>,
    interfaces: Vec<ResolvedInterface>,
}

/// Parse specs, resolve presets and build the seed image. Pure apart from
/// reading local files.
fn resolve(opts: &CreateOpts, config: &Config, instance_id: &str) -> Result<Resolved> {
    let disk_specs: Vec<_> = opts
        .disk
        .iter()
        .map(|d| parse_disk_spec(d))
        .collect::<Result<_>>()?;
    let nic_specs: Vec<_> = opts
        .nic
        .iter()
        .map(|n| parse_interface_spec(n))
        .collect::<Result<_>>()?;
    let seed_spec = opts
        .cloud_seed_disk
        .as_deref()
        .map(parse_seed_disk_spec)
        .transpose()?;

    let defaults = &config.defaults;
    let domain_type = opts
        .domain_type
        .clone()
        .or_else(|| defaults.domain_type.clone())
        .ok_or_else(|| {
            Error::validation("no domain type given; use --domain-type or set defaults.domain-type")
        })?;
    let cpu_model = opts.cpu_model.clone().or_else(|| defaults.cpu_model.clone());
    let preset_name = opts
        .domain_preset
        .as_deref()
        .or(defaults.domain_preset.as_deref())
        .ok_or_else(|| {
            Error::validation("use --domain-preset to select a domain preset to base the domain on")
        })?;
    let preset = config.presets.domain(preset_name)?;
    let machine_type = opts
        .machine_type
        .clone()
        .or_else(|| preset.machine_type.clone())
        .ok_or_else(|| {
            Error::validation(format!(
                "domain preset {preset_name} has no machine-type; use --machine-type"
            ))
        })?;
    let arch = opts.arch_name.clone().or_else(|| preset.arch_name.clone());
    let template = preset
        .template_text()?
        .map(|t| parse_template(&t))
        .transpose()?;

    let disks: Vec<_> = disk_specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            let preset = config.presets.disk(&spec.preset)?;
            resolve_disk(spec, preset, DiskRole::Data(i + 1), &opts.name)
        })
        .collect::<Result<_>>()?;
    let interfaces: Vec<_> = nic_specs
        .iter()
        .map(|spec| resolve_interface(spec, config.presets.interface(&spec.preset)?))
        .collect::<Result<_>>()?;

    let mut boot_orders = template_boot_orders(template.as_ref())?;
    boot_orders.extend(requested_boot_orders(&disks, &interfaces));
    check_boot_order(boot_orders)?;

    let seed = match &seed_spec {
        Some(spec) => {
            let preset = config.presets.disk(&spec.preset)?;
            let mut disk = resolve_disk(spec, preset, DiskRole::Seed, &opts.name)?;
            let user_data = read_cloud_file(opts.cloud_user_data_file.as_ref())?;
            let network_config = read_cloud_file(opts.cloud_network_config_file.as_ref())?;
            let meta_data = meta_data_yaml(instance_id, &opts.name)?;
            let image = build_seed(user_data.as_deref(), network_config.as_deref(), &meta_data)?;
            disk.size = Some(image.len() as u64);
            Some((disk, image))
        }
        None => None,
    };

    Ok(Resolved {
        arch,
        machine_type,
        domain_type,
        cpu_model,
        template,
        disks,
        seed,
        interfaces,
    })
}

fn create_volume(libvirt: &dyn Libvirt, attached: &AttachedDisk) -> Result<()> {
    let req = &attached.request;
    let xml = req.to_xml()?;
    match &req.clone_from {
        None => {
            info!("Creating volume {} in pool {}", req.name, req.pool);
            libvirt.create_volume(&req.pool, &xml)?;
        }
        Some(src) => {
            info!(
                "Creating volume {} in pool {} from {}/{}",
                req.name, req.pool, src.pool, src.volume
            );
            libvirt.clone_volume(&req.pool, &xml, &src.pool, &src.volume)?;
            if req.grow_after_clone {
                debug!("Growing volume {} to {} bytes", req.name, req.capacity);
                libvirt.resize_volume(&req.pool, &req.name, req.capacity)?;
            }
        }
    }
    Ok(())
}

/// Run `create` against `libvirt`.
#[instrument(skip_all, fields(name = %opts.name))]
pub(crate) fn run(opts: &CreateOpts, config: &Config, libvirt: &dyn Libvirt) -> Result<CreateOutput> {
    let instance_id = uuid::Uuid::new_v4().to_string();
    let resolved = resolve(opts, config, &instance_id)?;

    let caps = HostCapabilities::parse(&libvirt.capabilities()?)?;
    let arch = resolved
        .arch
        .or_else(|| caps.host_arch())
        .ok_or_else(|| Error::validation("unable to determine the guest architecture"))?;

    let planner = StoragePlanner::new(libvirt, &config.capabilities);
    let (seed_disk, seed_image) = resolved.seed.unzip();
    let mut disks: Vec<AttachedDisk> = resolved
        .disks
        .into_iter()
        .map(|d| planner.attach(d))
        .collect::<Result<_>>()?;
    let seed = match seed_disk {
        Some(disk) => {
            disks.push(planner.attach(disk)?);
            Some(disks.len() - 1)
        }
        None => None,
    };

    let vm = VmSpec {
        name: opts.name.clone(),
        instance_id,
        arch,
        machine_type: resolved.machine_type,
        domain_type: resolved.domain_type,
        cpu_model: resolved.cpu_model,
        vcpus: opts.vcpu,
        memory: opts.memory,
        disks,
        interfaces: resolved.interfaces,
        seed,
        template: resolved.template,
    };
    let domain = DomainDefinition::synthesize(&vm, &caps)?;
    let xml = domain.to_xml()?;

    let output = CreateOutput {
        instance_id: vm.instance_id.clone(),
        volumes: vm.disks.iter().map(|d| d.request.name.clone()).collect(),
    };

    if opts.dry_run {
        info!("Dry run; not creating volumes or defining the domain");
        info!("Domain XML:\n{xml}");
        return Ok(output);
    }

    if !vm.disks.is_empty() {
        let names = vm.disks.iter().map(|d| d.request.name.as_str()).join(", ");
        info!("Creating volumes {names}");
    }
    for (i, attached) in vm.disks.iter().enumerate() {
        create_volume(libvirt, attached)?;
        if Some(i) == vm.seed {
            if let Some(image) = &seed_image {
                info!("Uploading {} byte seed image", image.len());
                libvirt.upload_volume(&attached.request.pool, &attached.request.name, image)?;
            }
        }
    }

    libvirt.define_domain(&xml)?;
    info!("Defined domain {}", vm.name);
    Ok(output)
}
