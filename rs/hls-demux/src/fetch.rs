use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use url::Url;

use crate::playlist::ByteRange;
use crate::Result;

/// Byte range of a fetch; `end` is exclusive, `None` means to the end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchRange {
	pub start: u64,
	pub end: Option<u64>,
}

impl From<ByteRange> for FetchRange {
	fn from(range: ByteRange) -> Self {
		Self {
			start: range.offset,
			end: Some(range.offset + range.length),
		}
	}
}

/// An ordered sequence of payload chunks from one resource.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Downloads resources on behalf of the demuxer: playlists, keys and
/// segments.
///
/// The demuxer is independent of any particular HTTP client; callers provide
/// an implementation (the `hls-demux-native` crate ships a reqwest-backed
/// one). Cancellation is driven by the caller dropping the in-flight future,
/// so implementations must not hold state that outlives a call.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
	/// Fetch an entire resource into memory.
	async fn fetch(&self, url: &Url, range: Option<FetchRange>) -> Result<Bytes>;

	/// Fetch a resource as an ordered sequence of chunks.
	///
	/// A chunk error mid-stream is recoverable for the caller; the remainder
	/// of the resource is considered lost.
	async fn stream(&self, url: &Url, range: Option<FetchRange>) -> Result<ByteStream>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn range_from_byte_range() {
		let range = FetchRange::from(ByteRange { offset: 100, length: 200 });
		assert_eq!(range, FetchRange { start: 100, end: Some(300) });
	}
}
