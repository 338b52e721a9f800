pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod store;

pub use config::Config;
pub use proxy::orchestrator::AppState;
pub use server::{ServeConfig, serve};
pub use store::Store;
