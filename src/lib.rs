pub mod cli;
pub mod config;
pub mod domains;
pub mod errors;
pub mod events;
pub mod infrastructure;

pub use config::BridgeConfig;
pub use domains::sessions::SessionManager;
pub use errors::BridgeError;
