// Session lifecycle - registry, leases, transfer accounting.

pub mod session;
pub mod stats;
pub mod store;
pub mod transfer;
