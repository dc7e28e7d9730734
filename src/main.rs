use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use zstor::storage::mock::EmulatorZfs;
use zstor::storage::{Driver, PoolConfig, Services, VolumeConfig};

#[derive(Parser)]
#[command(version, about = "ZFS-backed container storage administration")]
struct Cli {
    /// The storage pool to operate on.
    #[arg(
        short = 'p',
        long,
        global = true,
        default_value = "default",
        help_heading = "Global options"
    )]
    pool: String,

    /// Pool source: a block device, loop file path, or existing dataset.
    ///
    /// Leave empty to back the pool with a sparse file under the state
    /// directory.
    #[arg(long, global = true, default_value = "", help_heading = "Global options")]
    source: String,

    /// The manager's state directory.
    #[arg(
        long,
        global = true,
        default_value = "/var/lib/zstor",
        help_heading = "Global options"
    )]
    var_dir: PathBuf,

    /// Client implementation.
    #[arg(
        long = "client",
        global = true,
        default_value = "cli",
        help_heading = "Global options"
    )]
    client: ClientType,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ClientType {
    /// Drive the real zfs/zpool tools.
    Cli,
    /// In-memory emulator for dry runs.
    Emulator,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the backing pool and its dataset layout.
    PoolCreate {
        /// Size in bytes for loop-file backed pools.
        #[arg(long, default_value = "21474836480")]
        size: String,

        /// Use a different name for the zpool itself.
        #[arg(long, default_value = "")]
        zpool_name: String,
    },
    /// Verify the pool is present and healthy, importing it if needed.
    PoolCheck,
    /// Destroy the pool and its backing store.
    PoolDelete,
    /// List driver-owned datasets in the pool.
    Users,
    /// Create a custom storage volume.
    VolumeCreate {
        /// The volume name.
        name: String,
    },
    /// Delete a custom storage volume.
    VolumeDelete {
        /// The volume name.
        name: String,
    },
    /// Mount a container volume.
    Mount {
        /// The container name.
        name: String,
    },
    /// Unmount a container volume.
    Umount {
        /// The container name.
        name: String,
    },
    /// List a container's snapshots with creation times.
    Snapshots {
        /// The container name.
        name: String,
    },
    /// Collect a graveyard entry or transient copy snapshot.
    Cleanup {
        /// The dataset path, relative to the pool.
        path: String,
    },
}

fn format_timestamp(timestamp: i64) -> String {
    match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(when) => when.format("%Y-%m-%d %H:%M").to_string(),
        _ => "-".to_string(),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let (size, zpool_name) = match &cli.command {
        Commands::PoolCreate { size, zpool_name } => (size.clone(), zpool_name.clone()),
        _ => (String::new(), String::new()),
    };
    let pool = PoolConfig {
        name: cli.pool.clone(),
        source: cli.source.clone(),
        size,
        zfs_pool_name: zpool_name,
    };

    let mut driver = match cli.client {
        ClientType::Cli => Driver::open(
            pool,
            VolumeConfig::default(),
            &cli.var_dir,
            Services::default(),
        )
        .context("initializing the storage driver")?,
        ClientType::Emulator => {
            let prefix = pool.prefix().to_string();
            Driver::new(
                pool,
                VolumeConfig::default(),
                Arc::new(EmulatorZfs::new(prefix)),
                &cli.var_dir,
                Services::default(),
            )
        }
    };

    match cli.command {
        Commands::PoolCreate { .. } => {
            driver.pool_create().context("creating the storage pool")?;
            println!("Pool '{}' created.", driver.pool_name());
        }
        Commands::PoolCheck => {
            driver.pool_check().context("checking the storage pool")?;
            println!("Pool '{}' is healthy.", driver.pool_name());
        }
        Commands::PoolDelete => {
            driver.pool_delete().context("deleting the storage pool")?;
            println!("Pool '{}' deleted.", driver.pool_name());
        }
        Commands::Users => {
            for user in driver.pool_users().context("listing pool users")? {
                println!("{user}");
            }
        }
        Commands::VolumeCreate { name } => {
            let driver = driver.with_volume(VolumeConfig {
                name: name.clone(),
                ..Default::default()
            });
            driver
                .custom_volume_create()
                .with_context(|| format!("creating volume '{name}'"))?;
            println!("Volume '{name}' created.");
        }
        Commands::VolumeDelete { name } => {
            let driver = driver.with_volume(VolumeConfig {
                name: name.clone(),
                ..Default::default()
            });
            driver
                .custom_volume_delete()
                .with_context(|| format!("deleting volume '{name}'"))?;
            println!("Volume '{name}' deleted.");
        }
        Commands::Mount { name } => {
            let ours = driver
                .container_mount(&name)
                .with_context(|| format!("mounting container '{name}'"))?;
            if ours {
                println!("Mounted '{name}'.");
            } else {
                println!("'{name}' was already mounted.");
            }
        }
        Commands::Umount { name } => {
            let ours = driver
                .container_umount(&name)
                .with_context(|| format!("unmounting container '{name}'"))?;
            if ours {
                println!("Unmounted '{name}'.");
            } else {
                println!("'{name}' was not mounted.");
            }
        }
        Commands::Snapshots { name } => {
            for (snapshot, created) in driver
                .container_snapshot_list(&name)
                .with_context(|| format!("listing snapshots of '{name}'"))?
            {
                println!("{snapshot}\t{}", format_timestamp(created));
            }
        }
        Commands::Cleanup { path } => {
            driver
                .cleanup(&path)
                .with_context(|| format!("cleaning up '{path}'"))?;
        }
    }

    Ok(())
}
