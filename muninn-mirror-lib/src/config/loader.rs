use std::fs;
use std::path::Path;

use crate::config::{Config, NetConfig};
use crate::error::{MirrorError, Result};

/// Smallest usable transfer log: one epoch of a few writes plus its barrier.
const MIN_TL_SIZE: usize = 8;

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| MirrorError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| MirrorError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    validate_net(&cfg.net)?;

    if cfg.disk.path.as_os_str().is_empty() {
        return Err(MirrorError::Config("disk.path must not be empty".into()));
    }

    Ok(())
}

pub(crate) fn validate_net(net: &NetConfig) -> Result<()> {
    if net.my_addr == net.peer_addr {
        return Err(MirrorError::Config(format!(
            "my_addr and peer_addr are both {}",
            net.my_addr
        )));
    }

    if net.tl_size < MIN_TL_SIZE {
        return Err(MirrorError::Config(format!(
            "tl_size {} is below the minimum of {MIN_TL_SIZE}",
            net.tl_size
        )));
    }

    if net.sync_rate == 0 {
        return Err(MirrorError::Config("sync_rate must be non-zero".into()));
    }

    Ok(())
}
