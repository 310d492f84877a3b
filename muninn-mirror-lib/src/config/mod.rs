mod loader;
mod types;

pub use loader::load_from_path;
pub(crate) use loader::validate_net;
pub use types::{Config, DiskConfig, LoggingConfig, MetaConfig, NetConfig, Protocol};
