pub const MEMBERSHIP_CONFIG: &'static str = include_str!("../reference.toml");

pub mod config;
pub mod connection;
pub mod coordination;
pub mod error;
pub mod ext;
pub mod listener;
pub mod live_server_set;
pub mod lock_record;
pub mod server_instance;
pub mod server_path;
pub mod snapshot;
pub mod stale_tracker;
