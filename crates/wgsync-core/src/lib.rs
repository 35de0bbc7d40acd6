//! wgsync-core: address allocation and config synchronization for a
//! WireGuard server whose peers live in a JSON record store.

pub mod addr;
pub mod allocation;
pub mod config;
pub mod drift;
pub mod error;
pub mod keys;
pub mod manager;
pub mod peer_config;
pub mod server_config;
pub mod store;
pub mod subnet_range;

pub use config::Config;
pub use error::{Error, Result};
pub use manager::{ClientUpdate, InterfaceUpdate, Manager, NewClient, SettingsUpdate};
pub use store::JsonStore;
pub use subnet_range::SubnetRangeRegistry;
