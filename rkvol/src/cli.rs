use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use libvolume::config::{DEFAULT_METADATA_ROOT, DEFAULT_MOUNT_ROOT, DEFAULT_STORAGE_BASE};

pub const DEFAULT_PLUGIN_NAME: &str = "azurefile";
pub const DEFAULT_SPEC_DIR: &str = "/etc/docker/plugins";
pub const DEFAULT_SOCKET_DIR: &str = "/run/docker/plugins";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Volume plugin serving named volumes from Azure File shares
#[derive(Parser, Debug)]
#[command(name = "rkvol", version, about)]
pub struct Args {
    /// Azure storage account name
    #[arg(long, env = "AZURE_STORAGE_ACCOUNT", default_value = "")]
    pub account_name: String,

    /// Azure storage account key (base64)
    #[arg(long, env = "AZURE_STORAGE_ACCOUNT_KEY", hide_env_values = true, default_value = "")]
    pub account_key: String,

    /// Azure storage service DNS suffix
    #[arg(long, env = "AZURE_STORAGE_BASE", default_value = DEFAULT_STORAGE_BASE)]
    pub storage_base: String,

    /// Directory under which volume mountpoints are created
    #[arg(long, env = "RKVOL_MOUNTPOINT", default_value = DEFAULT_MOUNT_ROOT)]
    pub mountpoint: PathBuf,

    /// Directory holding volume metadata files
    #[arg(long = "metadata", env = "RKVOL_METADATA", default_value = DEFAULT_METADATA_ROOT)]
    pub metadata_path: PathBuf,

    /// Delete the backing share when a volume is removed
    #[arg(long, env = "RKVOL_REMOVE_SHARES")]
    pub remove_shares: bool,

    /// Plugin name, used for the spec file or socket name
    #[arg(long, env = "RKVOL_PLUGIN_NAME", default_value = DEFAULT_PLUGIN_NAME)]
    pub plugin_name: String,

    /// Listen on this TCP address instead of a unix socket
    #[arg(long, env = "RKVOL_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Directory for the plugin spec file (TCP mode)
    #[arg(long, env = "RKVOL_SPEC_DIR", default_value = DEFAULT_SPEC_DIR)]
    pub spec_dir: PathBuf,

    /// Directory for the plugin socket (unix socket mode)
    #[arg(long, env = "RKVOL_SOCKET_DIR", default_value = DEFAULT_SOCKET_DIR)]
    pub socket_dir: PathBuf,

    /// Group owning the plugin socket
    #[arg(long, env = "RKVOL_GROUP")]
    pub group: Option<String>,

    /// Enable debug logging
    #[arg(long, env = "RKVOL_DEBUG")]
    pub debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}
