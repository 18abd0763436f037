// BitTorrent sessions - magnet resolution, leech-only peer swarm, ranged file reads.

pub mod adapter;
pub mod backend;
pub mod dht;
pub mod exchange;
pub mod layout;
pub mod magnet;
mod peer;
pub mod picker;
pub mod storage;
pub mod swarm;
pub mod tracker;
pub mod wire;

pub use adapter::{TorrentAdapter, TorrentCreated};
pub use backend::{ByteStream, SwarmEngine, SwarmError, SwarmFactory};
pub use layout::{TorrentFile, TorrentMetadata};
pub use magnet::{InfoHash, MagnetLink};
pub use swarm::{PeerSwarm, PeerSwarmFactory, SwarmConfig};
