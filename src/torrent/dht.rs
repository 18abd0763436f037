// Mainline DHT peer lookups (BEP 5), shared by every swarm of a factory.

use std::net::SocketAddr;

use anyhow::Result;
use futures::StreamExt;
use mainline::async_dht::AsyncDht;
use mainline::{Dht, Id};
use tracing::{debug, info};

use super::magnet::InfoHash;

#[derive(Clone)]
pub struct DhtDiscovery {
    dht: AsyncDht,
}

impl DhtDiscovery {
    /// Join the DHT as a read-only client node.
    pub fn start() -> Result<Self> {
        let dht = Dht::client()?;
        info!("mainline dht client started");
        Ok(Self {
            dht: dht.as_async(),
        })
    }

    /// Run one `get_peers` traversal, handing every peer found to `sink`.
    /// Returns the number of addresses seen.
    pub async fn lookup<F>(&self, info_hash: &InfoHash, mut sink: F) -> usize
    where
        F: FnMut(Vec<SocketAddr>),
    {
        let Ok(id) = Id::from_bytes(info_hash.as_bytes()) else {
            return 0;
        };
        let mut found = 0;
        let mut stream = self.dht.get_peers(id);
        while let Some(batch) = stream.next().await {
            found += batch.len();
            sink(batch.into_iter().map(SocketAddr::V4).collect());
        }
        debug!("dht lookup for {} returned {} peers", info_hash, found);
        found
    }
}
