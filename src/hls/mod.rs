// HLS relay - manifest rewriting and scoped segment proxying.

pub mod adapter;
pub mod manifest;
pub mod scope;

pub use adapter::{HlsAdapter, HlsCreated};
