use std::time::Duration;

use bytes::Bytes;

use crate::typefind::PayloadKind;

/// A chunk of decrypted segment payload, tagged for the downstream parser.
#[derive(Clone, Debug)]
pub struct Buffer {
	pub data: Bytes,

	/// Presentation timestamp.
	///
	/// Only the first buffer after expose or after a seek carries one; the
	/// downstream parser reconstructs the rest.
	pub pts: Option<Duration>,

	/// Set on the first buffer after a break in continuity.
	pub discont: bool,

	/// Running byte offsets since the last flush.
	pub offset: u64,
	pub offset_end: u64,
}

/// Stream metadata carried by the stream-start event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamFlags {
	/// The stream is sparse (subtitles).
	pub sparse: bool,
	/// The stream should be selected by default.
	pub select: bool,
}

/// Events delivered downstream, in order, per track: stream-start, caps,
/// segment, then buffers, then end-of-stream. Flush events bypass the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackEvent {
	StreamStart {
		/// Unique stream id of the form `<parent-stream-id>/NNN`.
		stream_id: String,
		/// Group id shared by all tracks of the demuxer.
		group_id: u32,
		flags: StreamFlags,
	},
	Caps(PayloadKind),
	Segment {
		start: Duration,
		/// Set iff the playlist is complete.
		duration: Option<Duration>,
	},
	Eos,
	FlushStart { seqnum: u32 },
	FlushStop { seqnum: u32 },
}

/// Result of handing an item to the downstream sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
	Ok,
	/// The output is not linked to anything; pause without error.
	NotLinked,
	/// Downstream is flushing; pause without error.
	Flushing,
	/// Anything else; pause and report an element error.
	Error,
}

/// Downstream capabilities of one track output.
///
/// The host pipeline implements this for each output it was handed; tests
/// inject an in-memory collaborator.
pub trait Sink: Send + Sync {
	fn push_buffer(&self, buffer: Buffer) -> Flow;
	fn push_event(&self, event: TrackEvent) -> Flow;
}
