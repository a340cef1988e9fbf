mod fetch;
mod log;

pub use fetch::*;
pub use log::*;

// Re-export the core crate.
pub use hls_demux;
