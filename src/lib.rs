pub mod config;
pub mod detect;
pub mod direct;
pub mod engine;
pub mod error;
pub mod hls;
pub mod logging;
pub mod range;
pub mod server;
pub mod source;
pub mod torrent;

pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use server::{router, RelayServer, RelayState};
