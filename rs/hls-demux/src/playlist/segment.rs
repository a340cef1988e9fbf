use std::time::Duration;

use url::Url;

/// A byte range within one media resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
	pub offset: u64,
	pub length: u64,
}

/// EXT-X-KEY METHOD
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyMethod {
	#[default]
	None,
	Aes128,
	SampleAes,
	Unknown,
}

/// EXT-X-KEY KEYFORMAT
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyFormat {
	#[default]
	Identity,
	Unknown,
}

/// EXT-X-KEY: decryption parameters for the segments that follow it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Key {
	pub method: KeyMethod,
	pub format: KeyFormat,
	pub uri: Option<Url>,
	/// Lower-case hex, optionally `0x`-prefixed; absent means the IV is
	/// derived from the segment sequence.
	pub iv: Option<String>,
}

/// EXT-X-MAP: media initialisation for the segments that follow it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Map {
	pub uri: Url,
	pub range: Option<ByteRange>,
}

/// One media file (or byte range of one), listed by a media playlist.
#[derive(Clone, Debug)]
pub struct Segment {
	pub uri: Url,
	pub duration: Duration,
	pub sequence: u64,
	pub range: Option<ByteRange>,
	pub discont: bool,

	/// Index into the owning playlist's keys.
	pub key: Option<usize>,
	/// Index into the owning playlist's maps.
	pub map: Option<usize>,
}
