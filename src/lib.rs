pub mod component;
pub mod config;
pub mod error;
pub mod filter;
pub mod locator;
pub mod partition;
pub mod process;
pub mod shutdown;
pub mod snapshot;
pub mod system;
pub mod tls;
