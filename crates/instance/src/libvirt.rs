//! The operations we need from the libvirt daemon, and an implementation
//! that drives `virsh`.
//!
//! In the future we may replace this with https://gitlab.com/libvirt/libvirt-rust

use std::io::Write as _;
use std::process::{Command, Stdio};

use tracing::{debug, instrument};

use crate::error::{Error, Result};

pub(crate) const DEFAULT_CONNECT_URI: &str = "qemu:///system";

/// Daemon queries and side effects used by `create`.
pub(crate) trait Libvirt {
    /// Host capabilities XML
    fn capabilities(&self) -> Result<String>;
    fn pool_xml(&self, pool: &str) -> Result<String>;
    fn list_volumes(&self, pool: &str) -> Result<Vec<String>>;
    fn volume_xml(&self, pool: &str, volume: &str) -> Result<String>;
    fn create_volume(&self, pool: &str, xml: &str) -> Result<()>;
    /// Create a volume in `pool` from `xml`, copying the data of `source`
    /// in `source_pool`.
    fn clone_volume(&self, pool: &str, xml: &str, source_pool: &str, source: &str) -> Result<()>;
    /// Grow a volume to `capacity` bytes, allocating the new space.
    fn resize_volume(&self, pool: &str, volume: &str, capacity: u64) -> Result<()>;
    fn upload_volume(&self, pool: &str, volume: &str, data: &[u8]) -> Result<()>;
    fn define_domain(&self, xml: &str) -> Result<()>;
}

/// Talks to libvirt through the `virsh` command line client.
#[derive(Debug, Clone)]
pub(crate) struct Virsh {
    connect: String,
}

impl Virsh {
    pub(crate) fn new(connect: impl Into<String>) -> Self {
        Self {
            connect: connect.into(),
        }
    }

    /// Build a virsh command with the connection URI
    fn virsh_command(&self) -> Command {
        let mut cmd = Command::new("virsh");
        cmd.arg("-c").arg(&self.connect);
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!("Running virsh {}", args.join(" "));
        let command = format!("virsh {}", args.first().copied().unwrap_or_default());
        let output = self
            .virsh_command()
            .args(args)
            .output()
            .map_err(|e| Error::Daemon {
                command: command.clone(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Daemon {
                command,
                message: stderr.trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_with_file(&self, args: &[&str], contents: &[u8], file_arg: usize) -> Result<String> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(contents)?;
        file.flush()?;
        let path = file.path().to_string_lossy().into_owned();
        let mut args = args.to_vec();
        args.insert(file_arg, path.as_str());
        self.run(&args)
    }
}

impl Libvirt for Virsh {
    #[instrument(skip(self))]
    fn capabilities(&self) -> Result<String> {
        self.run(&["capabilities"])
    }

    #[instrument(skip(self))]
    fn pool_xml(&self, pool: &str) -> Result<String> {
        self.run(&["pool-dumpxml", pool])
    }

    #[instrument(skip(self))]
    fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        let output = self.run(&["vol-list", "--pool", pool, "--name"])?;
        Ok(parse_volume_names(&output))
    }

    #[instrument(skip(self))]
    fn volume_xml(&self, pool: &str, volume: &str) -> Result<String> {
        self.run(&["vol-dumpxml", "--pool", pool, volume])
    }

    #[instrument(skip(self, xml))]
    fn create_volume(&self, pool: &str, xml: &str) -> Result<()> {
        self.run_with_file(&["vol-create", pool], xml.as_bytes(), 2)?;
        Ok(())
    }

    #[instrument(skip(self, xml))]
    fn clone_volume(&self, pool: &str, xml: &str, source_pool: &str, source: &str) -> Result<()> {
        self.run_with_file(
            &["vol-create-from", pool, source, "--inputpool", source_pool],
            xml.as_bytes(),
            2,
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn resize_volume(&self, pool: &str, volume: &str, capacity: u64) -> Result<()> {
        let capacity = capacity.to_string();
        self.run(&["vol-resize", volume, &capacity, "--pool", pool, "--allocate"])?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn upload_volume(&self, pool: &str, volume: &str, data: &[u8]) -> Result<()> {
        self.run_with_file(&["vol-upload", volume, "--pool", pool], data, 2)?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn define_domain(&self, xml: &str) -> Result<()> {
        let daemon_err = |message: String| Error::Daemon {
            command: "virsh define".into(),
            message,
        };
        let mut child = self
            .virsh_command()
            .args(["define", "/dev/stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| daemon_err(e.to_string()))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(xml.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(daemon_err(stderr.trim().to_owned()));
        }
        Ok(())
    }
}

/// Volume names from `vol-list --name`, one per line. Names may contain
/// spaces, so lines are kept whole.
fn parse_volume_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_owned)
        .collect()
}
