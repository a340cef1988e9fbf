//! An HTTP Live Streaming (HLS) demultiplexer.
//!
//! Feed a [Demux] the bytes of a master (or media) m3u8 playlist; it selects
//! a variant, discovers the variant's alternate renditions, and produces one
//! ordered stream of decrypted segment payloads per rendition, tagged with
//! discontinuity markers and presentation timestamps. Parsing the payloads
//! themselves (MPEG-TS, ID3, WebVTT) is the host pipeline's job.
//!
//! Network I/O lives behind the [Fetcher] contract; the `hls-demux-native`
//! crate provides a reqwest-backed implementation.

mod crypto;
mod demux;
mod error;
mod fetch;
mod queue;
mod sink;
mod track;
mod typefind;

#[cfg(test)]
mod testutil;

pub mod playlist;

pub use crypto::*;
pub use demux::*;
pub use error::*;
pub use fetch::*;
pub use queue::*;
pub use sink::*;
pub use track::*;
pub use typefind::*;
