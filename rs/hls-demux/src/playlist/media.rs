use std::mem;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset};
use md5::{Digest, Md5};
use tracing::{debug, trace, warn};
use url::Url;

use super::{
	join_uri, lines, parse_bool, parse_byte_range, parse_f64, parse_u32, parse_u64, strip_header, strip_quotes,
	Attributes, ByteRange, Key, KeyFormat, KeyMethod, Map, ParseError, Segment,
};

/// Highest playlist version this implementation understands.
pub const VERSION: u32 = 5;

/// EXT-X-PLAYLIST-TYPE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaylistType {
	Vod,
	Event,
}

/// One media playlist: an ordered list of segments plus its refresh state.
///
/// The playlist's identity and uri persist across refreshes; [Self::update]
/// reinitialises everything else when the body changed.
#[derive(Debug)]
pub struct MediaPlaylist {
	pub uri: Url,
	pub version: u32,
	pub playlist_type: Option<PlaylistType>,
	pub endlist: bool,
	pub allow_cache: bool,
	pub i_frames_only: bool,
	pub media_sequence: u64,
	pub program_date_time: Option<DateTime<FixedOffset>>,
	pub target_duration: Option<Duration>,

	/// Sum of all segment durations.
	pub duration: Duration,

	pub segments: Vec<Segment>,
	pub keys: Vec<Key>,
	pub maps: Vec<Map>,

	/// When the body was last downloaded.
	pub downloaded_at: Option<Instant>,

	digest: Option<[u8; 16]>,
}

/// Sticky parse state: the current key/map and the tags pending for the
/// next uri line.
#[derive(Default)]
struct ParserState {
	duration: Option<Duration>,
	range_length: Option<u64>,
	range_offset: u64,
	discont: bool,
	key: Option<usize>,
	map: Option<usize>,
	sequence: u64,
}

impl MediaPlaylist {
	pub fn new(uri: Url) -> Self {
		Self {
			uri,
			version: 0,
			playlist_type: None,
			endlist: false,
			allow_cache: false,
			i_frames_only: false,
			media_sequence: 0,
			program_date_time: None,
			target_duration: None,
			duration: Duration::ZERO,
			segments: Vec::new(),
			keys: Vec::new(),
			maps: Vec::new(),
			downloaded_at: None,
			digest: None,
		}
	}

	/// MD5 of the last parsed body; `Some` once the playlist was parsed.
	pub fn digest(&self) -> Option<[u8; 16]> {
		self.digest
	}

	/// Reparse the playlist from a downloaded body.
	///
	/// Returns `false` without touching the model when the body is
	/// byte-identical to the previous one.
	pub fn update(&mut self, data: &str) -> Result<bool, ParseError> {
		let body = strip_header(data)?;

		// check if the data changed since the last update
		let digest: [u8; 16] = Md5::digest(body.as_bytes()).into();
		if self.digest == Some(digest) {
			debug!(uri = %self.uri, "playlist is the same as the previous one");
			return Ok(false);
		}

		self.reset();
		self.digest = Some(digest);
		self.downloaded_at = Some(Instant::now());

		if let Err(err) = self.parse(body) {
			self.reset();
			return Err(err);
		}

		self.process();
		Ok(true)
	}

	fn reset(&mut self) {
		let uri = self.uri.clone();
		*self = Self::new(uri);
	}

	fn parse(&mut self, body: &str) -> Result<(), ParseError> {
		let mut state = ParserState::default();

		for line in lines(body) {
			if line.is_empty() {
				continue;
			}

			trace!("parsing `{line}`");

			if !line.starts_with('#') {
				self.parse_uri_line(line, &mut state)?;
			} else if line == "#EXT-X-ENDLIST" {
				self.endlist = true;
			} else if let Some(rest) = line.strip_prefix("#EXT-X-VERSION:") {
				self.version = parse_u32(rest)?;
				if self.version > VERSION {
					return Err(ParseError::UnsupportedVersion(self.version));
				}
			} else if let Some(rest) = line.strip_prefix("#EXT-X-PLAYLIST-TYPE:") {
				match rest {
					"VOD" => self.playlist_type = Some(PlaylistType::Vod),
					"EVENT" => self.playlist_type = Some(PlaylistType::Event),
					_ => warn!("unknown playlist type `{rest}`"),
				}
			} else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
				self.target_duration = Some(Duration::from_secs(parse_u64(rest)?));
			} else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
				self.media_sequence = parse_u64(rest)?;
			} else if line == "#EXT-X-DISCONTINUITY" {
				state.discont = true;
				state.map = None;
			} else if line == "#EXT-X-I-FRAMES-ONLY" {
				self.i_frames_only = true;
			} else if let Some(rest) = line.strip_prefix("#EXT-X-PROGRAM-DATE-TIME:") {
				match DateTime::parse_from_rfc3339(rest) {
					Ok(datetime) => self.program_date_time = Some(datetime),
					Err(_) => warn!("invalid program date time `{rest}`"),
				}
			} else if let Some(rest) = line.strip_prefix("#EXT-X-ALLOW-CACHE:") {
				match parse_bool(rest) {
					Some(value) => self.allow_cache = value,
					None => warn!("invalid ALLOW-CACHE value `{rest}`"),
				}
			} else if let Some(rest) = line.strip_prefix("#EXT-X-MAP:") {
				self.parse_map(rest, &mut state)?;
			} else if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
				self.parse_key(rest, &mut state)?;
			} else if let Some(rest) = line.strip_prefix("#EXTINF:") {
				// the duration runs up to the optional title
				let value = rest.split(',').next().unwrap_or(rest);
				let duration = Duration::try_from_secs_f64(parse_f64(value)?)
					.map_err(|_| ParseError::InvalidNumber(value.to_string()))?;
				state.duration = Some(duration);
			} else if let Some(rest) = line.strip_prefix("#EXT-X-BYTERANGE:") {
				match parse_byte_range(rest) {
					Some((length, offset)) => {
						state.range_length = Some(length);
						if let Some(offset) = offset {
							state.range_offset = offset;
						}
					}
					None => warn!("invalid byte range `{rest}`"),
				}
			} else {
				debug!("ignoring unsupported tag `{line}`");
			}
		}

		Ok(())
	}

	fn parse_uri_line(&mut self, line: &str, state: &mut ParserState) -> Result<(), ParseError> {
		let Some(duration) = state.duration.take() else {
			debug!("got uri line without EXTINF, dropping `{line}`");
			return Ok(());
		};

		let uri = join_uri(&self.uri, line)?;

		// a byte range continues where the previous one ended unless an
		// explicit offset reset it
		let range = state.range_length.take().map(|length| {
			let range = ByteRange {
				offset: state.range_offset,
				length,
			};
			state.range_offset += length;
			range
		});

		self.segments.push(Segment {
			uri,
			duration,
			sequence: state.sequence,
			range,
			discont: mem::take(&mut state.discont),
			key: state.key,
			map: state.map,
		});
		state.sequence += 1;

		Ok(())
	}

	fn parse_key(&mut self, data: &str, state: &mut ParserState) -> Result<(), ParseError> {
		let mut key = Key::default();

		for attr in Attributes::new(data) {
			let (name, value) = attr?;
			match name {
				"METHOD" => {
					key.method = match value {
						"NONE" => KeyMethod::None,
						"AES-128" => KeyMethod::Aes128,
						"SAMPLE-AES" => KeyMethod::SampleAes,
						_ => KeyMethod::Unknown,
					}
				}
				"URI" => {
					if let Some(value) = strip_quotes(value) {
						key.uri = Some(join_uri(&self.uri, value)?);
					}
				}
				"IV" => key.iv = Some(value.to_ascii_lowercase()),
				"KEYFORMAT" => {
					if let Some(value) = strip_quotes(value) {
						key.format = match value {
							"identity" => KeyFormat::Identity,
							_ => KeyFormat::Unknown,
						};
					}
				}
				"KEYFORMATVERSIONS" => debug!("ignoring KEYFORMATVERSIONS attribute `{value}`"),
				_ => {}
			}
		}

		if key.method == KeyMethod::None {
			// METHOD=NONE clears the current key
			state.key = None;
		} else {
			self.keys.push(key);
			state.key = Some(self.keys.len() - 1);
		}

		Ok(())
	}

	fn parse_map(&mut self, data: &str, state: &mut ParserState) -> Result<(), ParseError> {
		let mut uri = None;
		let mut range = None;

		for attr in Attributes::new(data) {
			let (name, value) = attr?;
			match name {
				"URI" => {
					if let Some(value) = strip_quotes(value) {
						uri = Some(join_uri(&self.uri, value)?);
					}
				}
				"BYTERANGE" => {
					if let Some(value) = strip_quotes(value) {
						match parse_byte_range(value) {
							Some((length, offset)) => {
								range = Some(ByteRange {
									offset: offset.unwrap_or(0),
									length,
								})
							}
							None => warn!("invalid map byte range `{value}`"),
						}
					}
				}
				_ => {}
			}
		}

		let Some(uri) = uri else {
			warn!("map with no uri, ignoring");
			return Ok(());
		};

		self.maps.push(Map { uri, range });
		state.map = Some(self.maps.len() - 1);

		Ok(())
	}

	/// Rebase sequence numbers, sum durations and repair the target
	/// duration after a successful parse.
	fn process(&mut self) {
		let mut max_duration = Duration::ZERO;

		self.duration = Duration::ZERO;
		for segment in &mut self.segments {
			segment.sequence += self.media_sequence;
			self.duration += segment.duration;
			max_duration = max_duration.max(segment.duration);
		}

		// EXT-X-TARGETDURATION must cover the longest segment, rounded up
		// to whole seconds
		let needed = Duration::from_secs(max_duration.as_secs() + u64::from(max_duration.subsec_nanos() > 0));
		if let Some(target) = self.target_duration {
			if needed > target {
				warn!(?needed, "fixing target duration");
				self.target_duration = Some(needed);
			}
		}

		debug!(
			uri = %self.uri,
			version = self.version,
			endlist = self.endlist,
			media_sequence = self.media_sequence,
			segments = self.segments.len(),
			duration = ?self.duration,
			"parsed media playlist"
		);
	}

	/// The first segment whose sequence is at least `sequence`, i.e. the
	/// next one available for download.
	pub fn get_segment(&self, sequence: u64) -> Option<&Segment> {
		self.segments.iter().find(|segment| segment.sequence >= sequence)
	}

	/// Resolve a segment's key reference.
	pub fn segment_key(&self, segment: &Segment) -> Option<&Key> {
		segment.key.and_then(|index| self.keys.get(index))
	}

	/// Resolve a segment's init-map reference.
	pub fn segment_map(&self, segment: &Segment) -> Option<&Map> {
		segment.map.and_then(|index| self.maps.get(index))
	}

	/// Complete and event playlists can be seeked and report a duration.
	pub fn is_seekable(&self) -> bool {
		self.endlist || self.playlist_type == Some(PlaylistType::Event)
	}

	/// A live playlist's tail can grow between refreshes.
	pub fn is_live(&self) -> bool {
		!self.is_seekable()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse(data: &str) -> MediaPlaylist {
		let mut playlist = MediaPlaylist::new(Url::parse("http://example.com/live/stream.m3u8").unwrap());
		assert!(playlist.update(data).unwrap());
		playlist
	}

	#[test]
	fn vod() {
		let playlist = parse(
			"#EXTM3U\n\
			#EXT-X-TARGETDURATION:10\n\
			#EXT-X-MEDIA-SEQUENCE:100\n\
			#EXTINF:9.97,\n\
			a.ts\n\
			#EXTINF:9.97,\n\
			b.ts\n\
			#EXT-X-ENDLIST\n",
		);

		assert!(playlist.endlist);
		assert_eq!(playlist.target_duration, Some(Duration::from_secs(10)));
		assert_eq!(playlist.duration, Duration::from_nanos(19_940_000_000));

		let sequences: Vec<_> = playlist.segments.iter().map(|s| s.sequence).collect();
		assert_eq!(sequences, [100, 101]);

		for segment in &playlist.segments {
			assert_eq!(segment.duration, Duration::from_nanos(9_970_000_000));
		}

		assert_eq!(playlist.segments[0].uri.as_str(), "http://example.com/live/a.ts");
		assert!(playlist.is_seekable());
	}

	#[test]
	fn sequences_rebase_to_media_sequence() {
		let playlist = parse(
			"#EXTM3U\n\
			#EXT-X-MEDIA-SEQUENCE:42\n\
			#EXTINF:4,\na.ts\n\
			#EXTINF:4,\nb.ts\n\
			#EXTINF:4,\nc.ts\n",
		);

		for (index, segment) in playlist.segments.iter().enumerate() {
			assert_eq!(segment.sequence, 42 + index as u64);
		}
		assert!(playlist.is_live());
	}

	#[test]
	fn byte_range_contiguity() {
		let playlist = parse(
			"#EXTM3U\n\
			#EXT-X-BYTERANGE:100\n\
			#EXTINF:4,\nall.ts\n\
			#EXT-X-BYTERANGE:200\n\
			#EXTINF:4,\nall.ts\n\
			#EXT-X-BYTERANGE:150\n\
			#EXTINF:4,\nall.ts\n",
		);

		let ranges: Vec<_> = playlist.segments.iter().map(|s| s.range.unwrap()).collect();
		assert_eq!(
			ranges,
			[
				ByteRange { offset: 0, length: 100 },
				ByteRange { offset: 100, length: 200 },
				ByteRange { offset: 300, length: 150 },
			]
		);
	}

	#[test]
	fn byte_range_explicit_offset_resets() {
		let playlist = parse(
			"#EXTM3U\n\
			#EXT-X-BYTERANGE:100\n\
			#EXTINF:4,\nall.ts\n\
			#EXT-X-BYTERANGE:50@1000\n\
			#EXTINF:4,\nall.ts\n\
			#EXT-X-BYTERANGE:50\n\
			#EXTINF:4,\nall.ts\n",
		);

		let ranges: Vec<_> = playlist.segments.iter().map(|s| s.range.unwrap()).collect();
		assert_eq!(
			ranges,
			[
				ByteRange { offset: 0, length: 100 },
				ByteRange { offset: 1000, length: 50 },
				ByteRange { offset: 1050, length: 50 },
			]
		);
	}

	#[test]
	fn unchanged_body_is_not_an_update() {
		let data = "#EXTM3U\n#EXTINF:4,\na.ts\n#EXTINF:4,\nb.ts\n";

		let mut playlist = MediaPlaylist::new(Url::parse("http://example.com/p.m3u8").unwrap());
		assert!(playlist.update(data).unwrap());
		let sequences: Vec<_> = playlist.segments.iter().map(|s| s.sequence).collect();

		assert!(!playlist.update(data).unwrap());
		assert_eq!(
			playlist.segments.iter().map(|s| s.sequence).collect::<Vec<_>>(),
			sequences
		);
		assert_eq!(playlist.segments.len(), 2);

		// a different body is an update again
		assert!(playlist.update("#EXTM3U\n#EXTINF:4,\na.ts\n").unwrap());
		assert_eq!(playlist.segments.len(), 1);
	}

	#[test]
	fn target_duration_repair() {
		let playlist = parse(
			"#EXTM3U\n\
			#EXT-X-TARGETDURATION:9\n\
			#EXTINF:10.5,\na.ts\n",
		);

		assert_eq!(playlist.target_duration, Some(Duration::from_secs(11)));
	}

	#[test]
	fn uri_without_extinf_is_dropped() {
		let playlist = parse(
			"#EXTM3U\n\
			orphan.ts\n\
			#EXTINF:4,\nkept.ts\n",
		);

		assert_eq!(playlist.segments.len(), 1);
		assert_eq!(playlist.segments[0].uri.as_str(), "http://example.com/live/kept.ts");
	}

	#[test]
	fn unsupported_version() {
		let mut playlist = MediaPlaylist::new(Url::parse("http://example.com/p.m3u8").unwrap());
		let err = playlist.update("#EXTM3U\n#EXT-X-VERSION:6\n").unwrap_err();
		assert_eq!(err, ParseError::UnsupportedVersion(6));

		// the failed parse left no stale state behind
		assert!(playlist.digest().is_none());
		assert!(playlist.segments.is_empty());
	}

	#[test]
	fn keys_apply_to_following_segments() {
		let playlist = parse(
			"#EXTM3U\n\
			#EXTINF:4,\nclear1.ts\n\
			#EXT-X-KEY:METHOD=AES-128,URI=\"key1.bin\",IV=0xABCDEF\n\
			#EXTINF:4,\nenc1.ts\n\
			#EXTINF:4,\nenc2.ts\n\
			#EXT-X-KEY:METHOD=NONE\n\
			#EXTINF:4,\nclear2.ts\n",
		);

		assert_eq!(playlist.keys.len(), 1);
		assert!(playlist.segment_key(&playlist.segments[0]).is_none());

		let key = playlist.segment_key(&playlist.segments[1]).unwrap();
		assert_eq!(key.method, KeyMethod::Aes128);
		assert_eq!(key.uri.as_ref().unwrap().as_str(), "http://example.com/live/key1.bin");
		assert_eq!(key.iv.as_deref(), Some("0xabcdef"));

		assert_eq!(playlist.segment_key(&playlist.segments[2]), Some(key));
		assert!(playlist.segment_key(&playlist.segments[3]).is_none());
	}

	#[test]
	fn unknown_key_method() {
		let playlist = parse(
			"#EXTM3U\n\
			#EXT-X-KEY:METHOD=FAIRPLAY-3000,URI=\"key.bin\"\n\
			#EXTINF:4,\na.ts\n",
		);

		let key = playlist.segment_key(&playlist.segments[0]).unwrap();
		assert_eq!(key.method, KeyMethod::Unknown);
	}

	#[test]
	fn discontinuity_clears_map() {
		let playlist = parse(
			"#EXTM3U\n\
			#EXT-X-MAP:URI=\"init.mp4\"\n\
			#EXTINF:4,\na.ts\n\
			#EXT-X-DISCONTINUITY\n\
			#EXTINF:4,\nb.ts\n",
		);

		assert!(playlist.segment_map(&playlist.segments[0]).is_some());
		assert!(!playlist.segments[0].discont);

		assert!(playlist.segment_map(&playlist.segments[1]).is_none());
		assert!(playlist.segments[1].discont);
	}

	#[test]
	fn get_segment_returns_next_available() {
		let playlist = parse(
			"#EXTM3U\n\
			#EXT-X-MEDIA-SEQUENCE:10\n\
			#EXTINF:4,\na.ts\n\
			#EXTINF:4,\nb.ts\n",
		);

		assert_eq!(playlist.get_segment(0).unwrap().sequence, 10);
		assert_eq!(playlist.get_segment(10).unwrap().sequence, 10);
		assert_eq!(playlist.get_segment(11).unwrap().sequence, 11);
		assert!(playlist.get_segment(12).is_none());
	}

	#[test]
	fn playlist_type_and_misc_tags() {
		let playlist = parse(
			"#EXTM3U\n\
			#EXT-X-VERSION:3\n\
			#EXT-X-PLAYLIST-TYPE:EVENT\n\
			#EXT-X-ALLOW-CACHE:YES\n\
			#EXT-X-I-FRAMES-ONLY\n\
			#EXT-X-PROGRAM-DATE-TIME:2010-02-19T14:54:23+08:00\n\
			#EXT-X-SOME-FUTURE-TAG:whatever\n\
			#EXTINF:4,\na.ts\n",
		);

		assert_eq!(playlist.version, 3);
		assert_eq!(playlist.playlist_type, Some(PlaylistType::Event));
		assert!(playlist.allow_cache);
		assert!(playlist.i_frames_only);
		assert!(playlist.program_date_time.is_some());
		assert!(playlist.is_seekable());
	}
}
