use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fuser::MountOption;
use keep_fuse::config::{Cli, Command, MountConfig};
use keep_fuse::{
    Backend, FsOptions, KeepFs, KeepClient, MemoryApi, MemoryKeep, MetadataApi, NoEvents,
    Operations,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How long to wait for the kernel to finish the mount handshake.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Mount {
            path,
            keep_dir,
            metadata,
            layout,
            collection,
            poll_interval,
            allow_other,
            auto_unmount,
            log_level,
        } => {
            let config = MountConfig {
                mount_point: path,
                keep_dir,
                metadata,
                layout,
                collection,
                poll_interval: Duration::from_secs(poll_interval),
                allow_other,
                auto_unmount,
                log_level,
            };

            // Set up logging
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
                )
                .init();

            mount(config)?;
        }

        Command::Unmount { path } => {
            unmount(&path)?;
            println!("Unmounted {}", path.display());
        }

        Command::Status { path } => {
            if path.exists() {
                if is_mounted(&path)? {
                    println!("Status: MOUNTED at {}", path.display());
                } else {
                    println!("Status: NOT MOUNTED (path exists but is not a mount point)");
                }
            } else {
                println!("Status: NOT MOUNTED (path does not exist)");
            }
        }
    }

    Ok(())
}

fn mount(config: MountConfig) -> anyhow::Result<()> {
    let Some(layout) = config.layout() else {
        anyhow::bail!("--layout collection requires --collection <locator>");
    };

    let keep: Arc<dyn KeepClient> = match &config.keep_dir {
        Some(dir) => Arc::new(MemoryKeep::load_dir(dir)?),
        None => Arc::new(MemoryKeep::new()),
    };
    let api: Arc<dyn MetadataApi> = match &config.metadata {
        Some(file) => Arc::new(MemoryApi::load_json(file)?),
        None => Arc::new(MemoryApi::new()),
    };

    // Create mount point if it doesn't exist
    std::fs::create_dir_all(&config.mount_point)?;

    // Get current user's uid/gid
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let ops = Arc::new(Operations::new(
        Backend::new(keep, api),
        Arc::new(NoEvents),
        layout,
        FsOptions {
            uid,
            gid,
            poll_interval: config.poll_interval,
        },
    ));

    let mut options = vec![
        MountOption::RO,
        MountOption::FSName("keep-fuse".into()),
        MountOption::AllowRoot,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let fs = KeepFs::new(ops.clone(), rt.handle().clone());
    let session = fuser::spawn_mount2(fs, &config.mount_point, &options)?;

    if !ops.wait_ready(READY_TIMEOUT) {
        anyhow::bail!(
            "mount at {} did not become ready within {:?}",
            config.mount_point.display(),
            READY_TIMEOUT
        );
    }
    println!("Mounted at {}", config.mount_point.display());
    info!("serving {}; press Ctrl-C to unmount", config.mount_point.display());

    rt.block_on(tokio::signal::ctrl_c())?;
    // Dropping the session unmounts.
    drop(session);
    println!("Unmounted");
    Ok(())
}

#[cfg(target_os = "macos")]
fn unmount(path: &PathBuf) -> anyhow::Result<()> {
    let output = std::process::Command::new("umount").arg(path).output()?;

    if !output.status.success() {
        anyhow::bail!("umount failed: {}", String::from_utf8_lossy(&output.stderr));
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn unmount(path: &PathBuf) -> anyhow::Result<()> {
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(path)
        .output()?;

    if !output.status.success() {
        anyhow::bail!(
            "fusermount -u failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn unmount(_path: &PathBuf) -> anyhow::Result<()> {
    anyhow::bail!("Unmount not supported on this platform")
}

fn is_mounted(path: &PathBuf) -> anyhow::Result<bool> {
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("mount").output()?;
        let mount_output = String::from_utf8_lossy(&output.stdout);
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        Ok(mount_output.contains(&canonical.display().to_string()))
    }

    #[cfg(target_os = "linux")]
    {
        let mounts = std::fs::read_to_string("/proc/mounts")?;
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        Ok(mounts.contains(&canonical.display().to_string()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Ok(false)
    }
}
