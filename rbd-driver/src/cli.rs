use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Exclusive-attach Ceph RBD volumes for this host.
#[derive(Parser, Debug)]
#[command(name = "rbd-driver", version, about, long_about = None)]
pub struct Cli {
    /// Scratch root for volume records and mount points [env: RBD_DRIVER_ROOT]
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// YAML configuration file [env: RBD_DRIVER_CONFIG]
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Driver option such as `ceph.servers=mon-a,mon-b`; can be set multiple times
    #[arg(short = 'o', long = "driver-opt", global = true, value_name = "KEY=VALUE")]
    pub driver_opts: Vec<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a volume, creating its image if needed
    Create {
        name: String,
        /// Image size such as 10G
        #[arg(short, long)]
        size: Option<String>,
        /// Pool holding the image
        #[arg(short, long)]
        pool: Option<String>,
        /// Filesystem created on first mount
        #[arg(long)]
        fstype: Option<String>,
    },
    /// Lock, map and mount a volume, printing its mount point
    Mount { name: String },
    /// Unmount, unmap and unlock a volume
    Unmount { name: String },
    /// Forget a detached volume
    Remove { name: String },
    /// Print the mount point of a volume
    Path { name: String },
    /// Print one volume record
    Get { name: String },
    /// Print every volume record
    List,
    /// Print the optional operations this driver supports
    Capabilities,
    /// Print the driver settings
    Info,
    /// Re-check an inconsistent volume against the host and the cluster
    Clear { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "rbd-driver",
            "create",
            "data1",
            "--size",
            "10G",
            "-o",
            "ceph.pool=rancher",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.driver_opts, vec!["ceph.pool=rancher"]);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(
            cli.command,
            Command::Create { ref name, size: Some(ref size), .. } if name == "data1" && size == "10G"
        ));
    }
}
