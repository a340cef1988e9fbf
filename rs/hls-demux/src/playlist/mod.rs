//! m3u8 playlist parsing and the in-memory playlist model.
//!
//! [MasterPlaylist::parse] consumes a master (or bare media) playlist and
//! yields the typed model; [MediaPlaylist::update] (re)parses a media
//! playlist body with MD5-based change detection, so live refreshes that
//! did not change the tail are cheap no-ops.

mod attribute;
mod master;
mod media;
mod segment;

pub use attribute::*;
pub use master::*;
pub use media::*;
pub use segment::*;

/// A list of possible errors raised while parsing a playlist.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("playlist does not start with #EXTM3U")]
	MissingHeader,

	#[error("unsupported playlist version {0}")]
	UnsupportedVersion(u32),

	#[error("attribute without a value")]
	MissingEquals,

	#[error("unterminated quoted string")]
	UnterminatedQuote,

	#[error("invalid number `{0}`")]
	InvalidNumber(String),

	#[error("invalid uri `{0}`")]
	InvalidUri(String),
}

/// Split the `#EXTM3U` header off, returning the remaining body.
///
/// The first non-empty line must be the header; everything after it is the
/// body that change detection digests.
pub(crate) fn strip_header(data: &str) -> Result<&str, ParseError> {
	let mut rest = data;
	loop {
		let (line, next) = match rest.find('\n') {
			Some(end) => (&rest[..end], &rest[end + 1..]),
			None => (rest, ""),
		};
		let line = line.strip_suffix('\r').unwrap_or(line);

		if line.is_empty() {
			if next.is_empty() {
				return Err(ParseError::MissingHeader);
			}
			rest = next;
			continue;
		}

		return match line {
			"#EXTM3U" => Ok(next),
			_ => Err(ParseError::MissingHeader),
		};
	}
}

/// Iterate the lines of a playlist body, accepting LF and CRLF endings.
pub(crate) fn lines(data: &str) -> impl Iterator<Item = &str> {
	data.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line))
}
