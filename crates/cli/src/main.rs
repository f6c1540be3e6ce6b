//! Administrative CLI over the DSU service, plus the boot-path hooks
//! init uses to decide whether to enter the installed image.

use std::io::Read;

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use dsu_lib::backend::FileBackend;
use dsu_lib::boot;
use dsu_lib::error::StatusCode;
use dsu_lib::fstab::DiskFstab;
use dsu_lib::install::InstallParams;
use dsu_lib::paths::Paths;
use dsu_lib::service::Service;
use dsu_lib::statestore::StatusStore;

/// Payload streaming granularity.
const CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Parser)]
#[clap(name = "dsuctl", version)]
struct Cli {
    /// Operate on a layout rooted at this directory instead of /.
    #[clap(long, global = true)]
    root: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show install and boot state.
    Status {
        /// Emit JSON instead of text.
        #[clap(long)]
        json: bool,
    },
    /// Install a GSI from a file or stdin, then make it bootable.
    Install {
        /// Size of the system payload in bytes; defaults to the input
        /// file's length.
        #[clap(long)]
        gsi_size: Option<u64>,
        /// Size of the userdata image to allocate; 0 picks a default.
        #[clap(long, default_value_t = 0)]
        userdata_size: u64,
        /// Recreate userdata even if an image already exists.
        #[clap(long)]
        wipe: bool,
        /// Target directory for the backing images.
        #[clap(long, default_value = "")]
        install_dir: Utf8PathBuf,
        /// Enable the image for a single boot only.
        #[clap(long)]
        one_shot: bool,
        /// Payload file; reads stdin when omitted.
        image: Option<Utf8PathBuf>,
    },
    /// Re-enable a disabled install.
    Enable {
        /// Enable for a single boot only.
        #[clap(long)]
        one_shot: bool,
    },
    /// Disable booting into the installed image.
    Disable,
    /// Remove the install, or schedule a wipe while the image runs.
    Remove,
    /// Destroy and recreate the userdata image.
    WipeData,
    /// Cancel an in-flight installation.
    Cancel,
    /// Show progress of an in-flight installation.
    Progress,
    /// Run the one-time startup reconciliation.
    StartupTasks,
    /// Boot-path hook: decide whether this boot may enter the image.
    CanBoot,
    /// Boot-path hook: record that the running system is the GSI.
    MarkBooted,
    /// Boot-path hook: confirm that the prior boot of the image
    /// succeeded.
    MarkBootOk,
}

fn open_service(paths: &Paths) -> Result<Service> {
    let backend = Box::new(FileBackend::new(&paths.image_metadata_root));
    let fstab = Box::new(DiskFstab::new(&paths.fstab));
    Service::new(paths.clone(), backend, fstab)
}

fn caller_uid() -> u32 {
    rustix::process::getuid().as_raw()
}

fn ensure(code: StatusCode, what: &str) -> Result<()> {
    if !code.is_ok() {
        bail!("{what} failed with status {}", code.as_raw());
    }
    Ok(())
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = match &cli.root {
        Some(root) => Paths::under(root),
        None => Paths::default(),
    };
    let uid = caller_uid();

    match cli.cmd {
        Command::Status { json } => {
            let service = open_service(&paths)?;
            let installed = service.is_gsi_installed(uid)?;
            let running = service.is_gsi_running(uid)?;
            let enabled = service.is_gsi_enabled(uid)?;
            let in_progress = service.is_install_in_progress(uid)?;
            let boot_status = service.gsi_boot_status(uid)?;
            if json {
                let v = serde_json::json!({
                    "installed": installed,
                    "running": running,
                    "enabled": enabled,
                    "installInProgress": in_progress,
                    "bootStatus": boot_status,
                });
                println!("{}", serde_json::to_string_pretty(&v)?);
            } else {
                println!("boot status: {boot_status}");
                println!("installed: {installed}");
                println!("running: {running}");
                println!("enabled: {enabled}");
                println!("install in progress: {in_progress}");
            }
        }
        Command::Install {
            gsi_size,
            userdata_size,
            wipe,
            install_dir,
            one_shot,
            image,
        } => {
            let service = open_service(&paths)?;
            let (mut input, size): (Box<dyn Read>, u64) = match &image {
                Some(path) => {
                    let f = std::fs::File::open(path).with_context(|| format!("opening {path}"))?;
                    let len = f.metadata()?.len();
                    (Box::new(f), gsi_size.unwrap_or(len))
                }
                None => {
                    let Some(size) = gsi_size else {
                        bail!("--gsi-size is required when reading from stdin");
                    };
                    (Box::new(std::io::stdin()), size)
                }
            };
            let params = InstallParams {
                gsi_size: size,
                userdata_size,
                wipe_userdata: wipe,
                install_dir,
            };
            ensure(service.begin_install(uid, params)?, "starting install")?;

            let mut remaining = size;
            while remaining > 0 {
                let chunk = remaining.min(CHUNK_SIZE);
                if !service.commit_chunk_from_stream(uid, input.as_mut(), chunk)? {
                    bail!("payload chunk was not accepted");
                }
                remaining -= chunk;
            }
            ensure(service.set_bootable(uid, one_shot)?, "finalizing install")?;
            println!("install succeeded");
        }
        Command::Enable { one_shot } => {
            let service = open_service(&paths)?;
            ensure(service.set_bootable(uid, one_shot)?, "enable")?;
            println!("enabled");
        }
        Command::Disable => {
            let service = open_service(&paths)?;
            if !service.disable_install(uid)? {
                bail!("disable failed");
            }
            println!("disabled");
        }
        Command::Remove => {
            let service = open_service(&paths)?;
            if !service.remove_install(uid)? {
                bail!("remove failed");
            }
        }
        Command::WipeData => {
            let service = open_service(&paths)?;
            ensure(service.wipe_gsi_userdata(uid)?, "userdata wipe")?;
        }
        Command::Cancel => {
            let service = open_service(&paths)?;
            if !service.cancel_install(uid)? {
                bail!("cancel failed");
            }
        }
        Command::Progress => {
            let service = open_service(&paths)?;
            let progress = service.get_progress(uid)?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Command::StartupTasks => {
            let service = open_service(&paths)?;
            service.run_startup_tasks();
        }
        Command::CanBoot => {
            let store = StatusStore::open(&paths.metadata_dir)?;
            if boot::can_boot_into_gsi(&store) {
                println!("eligible");
            } else {
                println!("ineligible");
                std::process::exit(1);
            }
        }
        Command::MarkBooted => {
            let store = StatusStore::open(&paths.metadata_dir)?;
            boot::mark_system_as_gsi(&store)?;
        }
        Command::MarkBootOk => {
            let store = StatusStore::open(&paths.metadata_dir)?;
            boot::mark_boot_successful(&store)?;
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}
