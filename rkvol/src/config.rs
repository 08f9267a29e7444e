//! Daemon configuration.
//!
//! Turns parsed command-line [`Args`] (flags or their environment variables)
//! into the library's [`DriverConfig`] and [`ListenAddr`].
//!
//! Environment variables:
//! - `AZURE_STORAGE_ACCOUNT`, `AZURE_STORAGE_ACCOUNT_KEY`: credentials. Both are
//!   required; the daemon refuses to start without them.
//! - `AZURE_STORAGE_BASE`: storage DNS suffix, defaults to `core.windows.net`.
//! - `RKVOL_*`: mirror the remaining long flags.

use anyhow::{Context, Result, bail};
use libvolume::{AccountKey, DriverConfig, ListenAddr};
use nix::unistd::Uid;

use crate::cli::Args;

pub fn driver_config(args: &Args) -> Result<DriverConfig> {
    let config = DriverConfig {
        account_name: args.account_name.clone(),
        account_key: AccountKey::new(args.account_key.clone()),
        storage_base: args.storage_base.clone(),
        mount_root: args.mountpoint.clone(),
        metadata_root: args.metadata_path.clone(),
        remove_shares: args.remove_shares,
    };
    config.validate().context("invalid driver configuration")?;
    Ok(config)
}

pub fn listen_addr(args: &Args) -> ListenAddr {
    match args.listen {
        Some(addr) => ListenAddr::Tcp {
            addr,
            spec_dir: args.spec_dir.clone(),
        },
        None => ListenAddr::Unix {
            socket_dir: args.socket_dir.clone(),
            group: args.group.clone(),
        },
    }
}

/// Mounting and writing the plugin directories require root.
pub fn ensure_root(uid: Uid) -> Result<()> {
    if !uid.is_root() {
        bail!("rkvol must run as root (running as uid {uid})");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::PathBuf;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["rkvol", "--account-name", "acct", "--account-key", "a2V5"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn maps_args_to_driver_config() {
        let cfg = driver_config(&args(&["--remove-shares", "--mountpoint", "/mnt/v"])).unwrap();
        assert_eq!(cfg.account_name, "acct");
        assert_eq!(cfg.account_key.expose(), "a2V5");
        assert_eq!(cfg.mount_root, PathBuf::from("/mnt/v"));
        assert!(cfg.remove_shares);
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let args = Args::try_parse_from(["rkvol", "--account-name", "", "--account-key", ""]).unwrap();
        let err = driver_config(&args).unwrap_err();
        assert!(format!("{err:#}").contains("account name and key"));
    }

    #[test]
    fn unix_socket_unless_tcp_requested() {
        assert_eq!(
            listen_addr(&args(&["--group", "docker"])),
            ListenAddr::Unix {
                socket_dir: PathBuf::from("/run/docker/plugins"),
                group: Some("docker".into()),
            }
        );
        assert_eq!(
            listen_addr(&args(&["--listen", "0.0.0.0:8080", "--spec-dir", "/tmp/p"])),
            ListenAddr::Tcp {
                addr: "0.0.0.0:8080".parse().unwrap(),
                spec_dir: PathBuf::from("/tmp/p"),
            }
        );
    }

    #[test]
    fn root_is_required() {
        assert!(ensure_root(Uid::from_raw(0)).is_ok());
        assert!(ensure_root(Uid::from_raw(1000)).is_err());
    }
}
