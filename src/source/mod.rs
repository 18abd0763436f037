// Upstream HTTP sources for HLS and direct-proxy sessions.

pub mod upstream;
