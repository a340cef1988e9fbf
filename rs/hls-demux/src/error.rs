use crate::crypto::CryptoError;
use crate::playlist::ParseError;

/// A list of possible errors produced by the demuxer.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
	/// The playlist is malformed or declares an unsupported version.
	#[error("parse error: {0}")]
	Parse(#[from] ParseError),

	/// A network or transport failure while downloading a resource.
	#[error("fetch failed: {0}")]
	Fetch(String),

	/// An in-flight fetch was preempted by a flush or teardown.
	#[error("fetch cancelled")]
	Cancelled,

	#[error("crypto error: {0}")]
	Crypto(#[from] CryptoError),

	/// The queue is flushing; a benign wake-up during seek or teardown.
	#[error("flushing")]
	Flushing,

	/// The downstream sink returned a fatal flow status.
	#[error("downstream flow error")]
	Flow,

	/// The master playlist contains no variant that can be played.
	#[error("no playable variant")]
	NoVariant,

	/// The peer never provided the playlist uri.
	#[error("missing source uri")]
	MissingUri,
}

pub type Result<T> = std::result::Result<T, Error>;
