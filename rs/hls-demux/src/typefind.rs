/// Payload classification of a track, decided from the first bytes of the
/// first downloaded segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
	Id3,
	WebVtt,
	MpegTs,
}

impl PayloadKind {
	/// Classify a payload from its leading bytes.
	///
	/// Anything that is neither an ID3 tag nor a WebVTT header is assumed to
	/// be an MPEG transport stream.
	pub fn detect(data: &[u8]) -> Self {
		if detect_id3(data) {
			Self::Id3
		} else if detect_webvtt(data) {
			Self::WebVtt
		} else {
			Self::MpegTs
		}
	}

	/// The capabilities negotiated on the track's output channel.
	pub fn caps(&self) -> &'static str {
		match self {
			Self::Id3 => "application/x-id3",
			Self::WebVtt => "text/vtt",
			Self::MpegTs => "video/mpegts, systemstream=true",
		}
	}
}

fn detect_id3(data: &[u8]) -> bool {
	data.len() >= 10
		&& &data[0..3] == b"ID3"
		&& data[3] != 0xff
		&& data[4] != 0xff
		&& data[6] & 0x80 == 0
		&& data[7] & 0x80 == 0
		&& data[8] & 0x80 == 0
		&& data[9] & 0x80 == 0
}

fn detect_webvtt(data: &[u8]) -> bool {
	// skip the UTF-8 BOM
	let data = data.strip_prefix(&[0xef, 0xbb, 0xbf]).unwrap_or(data);

	data.len() >= 6
		&& &data[0..6] == b"WEBVTT"
		&& (data.len() == 6 || matches!(data[6], b'\n' | b'\r' | b'\t' | b' '))
}
