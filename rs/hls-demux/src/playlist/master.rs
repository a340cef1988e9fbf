use std::collections::HashMap;

use tracing::{debug, trace, warn};
use url::Url;

use super::{
	join_uri, lines, parse_resolution, parse_u32, strip_header, strip_quotes, Attributes, MediaPlaylist, ParseError,
	VERSION,
};

/// EXT-X-MEDIA TYPE: all renditions of a group share one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
	Audio,
	Video,
	Subtitles,
}

/// Codec identities recognised in the CODECS attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaCodec {
	GenericAudio, // mp4a
	AacLc,        // mp4a.40.2
	HeAac,        // mp4a.40.5
	Mp3,          // mp4a.40.34
	GenericH264,  // avc1
	H264Base,     // avc1.42e0XX
	H264Main,     // avc1.4d40XX
	H264High,     // avc1.6400XX
}

impl MediaCodec {
	/// Map one CODECS entry to its identity and media type.
	fn parse(codec: &str) -> Option<(Self, MediaType)> {
		let entry = match codec {
			"mp4a.40.2" => (Self::AacLc, MediaType::Audio),
			"mp4a.40.5" => (Self::HeAac, MediaType::Audio),
			"mp4a.40.34" => (Self::Mp3, MediaType::Audio),
			_ if codec.starts_with("avc1.42e0") => (Self::H264Base, MediaType::Video),
			_ if codec.starts_with("avc1.4d40") => (Self::H264Main, MediaType::Video),
			_ if codec.starts_with("avc1.6400") => (Self::H264High, MediaType::Video),
			_ if codec.starts_with("mp4a") => (Self::GenericAudio, MediaType::Audio),
			_ if codec.starts_with("avc1") => (Self::GenericH264, MediaType::Video),
			_ => return None,
		};
		Some(entry)
	}
}

/// EXT-X-MEDIA: one alternate rendition in a group.
#[derive(Debug)]
pub struct Rendition {
	pub media_type: MediaType,
	pub group_id: String,
	pub name: Option<String>,
	pub language: Option<String>,
	/// Absent when the rendition's media is carried by the variant itself.
	pub uri: Option<Url>,
	pub is_default: bool,
	pub autoselect: bool,
	pub forced: bool,

	/// The rendition's own media playlist, present iff it has a uri.
	pub playlist: Option<MediaPlaylist>,
}

/// EXT-X-STREAM-INF: one bitrate/resolution variant of the program.
#[derive(Debug, Default)]
pub struct Variant {
	pub i_frames_only: bool,
	pub bandwidth: u64,
	pub program_id: Option<u32>,
	pub video_codec: Option<MediaCodec>,
	pub audio_codec: Option<MediaCodec>,
	pub width: u32,
	pub height: u32,

	/// Rendition groups referenced by group id.
	pub audio: Option<String>,
	pub video: Option<String>,
	pub subtitles: Option<String>,

	/// The variant's own media playlist, filled from the uri line that
	/// follows the tag. Taken by the coordinator when a track is created.
	pub playlist: Option<MediaPlaylist>,
}

/// The master playlist: variants plus their alternate rendition groups.
#[derive(Debug)]
pub struct MasterPlaylist {
	pub uri: Url,
	pub version: u32,
	pub variants: Vec<Variant>,
	pub i_frame_variants: Vec<Variant>,

	/// Renditions by group id, each group in declaration order.
	pub groups: HashMap<String, Vec<Rendition>>,
}

impl MasterPlaylist {
	/// Parse a master playlist.
	///
	/// A playlist without any EXT-X-STREAM-INF is a media playlist; a
	/// synthetic single variant is fabricated around it so the caller sees
	/// one model either way.
	pub fn parse(uri: Url, data: &str) -> Result<Self, ParseError> {
		let mut master = Self {
			uri,
			version: 0,
			variants: Vec::new(),
			i_frame_variants: Vec::new(),
			groups: HashMap::new(),
		};

		if !data.contains("#EXT-X-STREAM-INF:") {
			debug!("parsing rendition playlist");
			let mut playlist = MediaPlaylist::new(master.uri.clone());
			playlist.update(data)?;
			master.variants.push(Variant {
				playlist: Some(playlist),
				..Default::default()
			});
			return Ok(master);
		}

		debug!("parsing variant playlist");
		let body = strip_header(data)?;
		let mut pending: Option<Variant> = None;

		for line in lines(body) {
			if line.is_empty() {
				continue;
			}

			trace!("parsing `{line}`");

			if !line.starts_with('#') {
				match pending.take() {
					Some(mut variant) => {
						variant.playlist = Some(MediaPlaylist::new(join_uri(&master.uri, line)?));
						master.variants.push(variant);
					}
					None => debug!("got uri line without EXT-X-STREAM-INF, dropping `{line}`"),
				}
			} else if let Some(rest) = line.strip_prefix("#EXT-X-VERSION:") {
				master.version = parse_u32(rest)?;
				if master.version > VERSION {
					return Err(ParseError::UnsupportedVersion(master.version));
				}
			} else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA:") {
				master.parse_media(rest)?;
			} else if let Some(rest) = line.strip_prefix("#EXT-X-I-FRAME-STREAM-INF:") {
				if pending.take().is_some() {
					warn!("dropping stream with no uri");
				}
				// i-frame streams carry their uri as an attribute
				let variant = master.parse_variant(rest, true)?;
				master.i_frame_variants.push(variant);
			} else if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
				if pending.take().is_some() {
					warn!("dropping stream with no uri");
				}
				pending = Some(master.parse_variant(rest, false)?);
			} else {
				debug!("ignoring unsupported tag `{line}`");
			}
		}

		if pending.is_some() {
			warn!("dropping stream with no uri");
		}

		Ok(master)
	}

	fn parse_media(&mut self, data: &str) -> Result<(), ParseError> {
		let mut media_type = None;
		let mut group_id: Option<String> = None;
		let mut name = None;
		let mut language = None;
		let mut uri = None;
		let mut is_default = true;
		let mut autoselect = false;
		let mut forced = false;

		for attr in Attributes::new(data) {
			let (attr, value) = attr?;
			match attr {
				"TYPE" => {
					media_type = match value {
						"AUDIO" => Some(MediaType::Audio),
						"VIDEO" => Some(MediaType::Video),
						"SUBTITLES" => Some(MediaType::Subtitles),
						_ => None,
					}
				}
				"GROUP-ID" if group_id.is_none() => {
					if let Some(value) = strip_quotes(value) {
						group_id = Some(value.to_string());
					}
				}
				"NAME" => name = strip_quotes(value).map(str::to_string),
				"LANGUAGE" => language = strip_quotes(value).map(str::to_string),
				"DEFAULT" => match super::parse_bool(value) {
					Some(value) => is_default = value,
					None => warn!("invalid DEFAULT value"),
				},
				"AUTOSELECT" => match super::parse_bool(value) {
					Some(value) => autoselect = value,
					None => warn!("invalid AUTOSELECT value"),
				},
				"FORCED" => match super::parse_bool(value) {
					Some(value) => forced = value,
					None => warn!("invalid FORCED value"),
				},
				"URI" => {
					if let Some(value) = strip_quotes(value) {
						uri = Some(join_uri(&self.uri, value)?);
					}
				}
				_ => {}
			}
		}

		let Some(media_type) = media_type else {
			warn!("media with no type, ignoring");
			return Ok(());
		};
		let Some(group_id) = group_id else {
			warn!("media with no group id, ignoring");
			return Ok(());
		};

		let playlist = uri.clone().map(MediaPlaylist::new);
		let rendition = Rendition {
			media_type,
			group_id: group_id.clone(),
			name,
			language,
			uri,
			is_default,
			autoselect,
			forced,
			playlist,
		};

		let group = self.groups.entry(group_id).or_default();
		if let Some(first) = group.first() {
			if first.media_type != media_type {
				warn!(group = %rendition.group_id, "invalid media for group, ignoring");
				return Ok(());
			}
		}
		group.push(rendition);

		Ok(())
	}

	fn parse_variant(&self, data: &str, i_frames_only: bool) -> Result<Variant, ParseError> {
		let mut variant = Variant {
			i_frames_only,
			..Default::default()
		};

		for attr in Attributes::new(data) {
			let (attr, value) = attr?;
			match attr {
				"BANDWIDTH" => match value.parse() {
					Ok(value) => variant.bandwidth = value,
					Err(_) => warn!("invalid stream bandwidth `{value}`"),
				},
				"PROGRAM-ID" => match value.parse() {
					Ok(value) => variant.program_id = Some(value),
					Err(_) => warn!("invalid stream program id `{value}`"),
				},
				"CODECS" => {
					if let Some(value) = strip_quotes(value) {
						for codec in value.split(',').take(3) {
							if let Some((codec, media_type)) = MediaCodec::parse(codec.trim()) {
								match media_type {
									MediaType::Audio => variant.audio_codec = Some(codec),
									MediaType::Video => variant.video_codec = Some(codec),
									MediaType::Subtitles => {}
								}
							}
						}
					}
				}
				"RESOLUTION" => match parse_resolution(value) {
					Some((width, height)) => {
						variant.width = width;
						variant.height = height;
					}
					None => warn!("invalid stream resolution `{value}`"),
				},
				"VIDEO" => variant.video = strip_quotes(value).map(str::to_string),
				"AUDIO" if !i_frames_only => variant.audio = strip_quotes(value).map(str::to_string),
				"SUBTITLES" if !i_frames_only => variant.subtitles = strip_quotes(value).map(str::to_string),
				"URI" if i_frames_only => {
					if let Some(value) = strip_quotes(value) {
						variant.playlist = Some(MediaPlaylist::new(join_uri(&self.uri, value)?));
					}
				}
				_ => {}
			}
		}

		Ok(variant)
	}

	/// Select the variant with the highest bandwidth strictly below
	/// `max_bandwidth`, falling back to the lowest-bandwidth variant when
	/// none qualifies. Zero means no cap. Ties go to the first variant
	/// encountered. Returns an index into [Self::variants].
	pub fn select_variant(&self, max_bandwidth: u64) -> Option<usize> {
		let max = match max_bandwidth {
			0 => u64::MAX,
			max => max,
		};

		let mut lowest: Option<usize> = None;
		let mut best: Option<usize> = None;

		for (index, variant) in self.variants.iter().enumerate() {
			if lowest.is_none_or(|lowest| variant.bandwidth < self.variants[lowest].bandwidth) {
				lowest = Some(index);
			}

			if variant.bandwidth < max && best.is_none_or(|best| variant.bandwidth > self.variants[best].bandwidth) {
				best = Some(index);
			}
		}

		best.or(lowest)
	}

	/// The renditions of a group, or `None` for an unknown group id.
	pub fn find_group(&self, group_id: &str) -> Option<&[Rendition]> {
		self.groups.get(group_id).map(Vec::as_slice)
	}

	/// Guess the payload type of a variant's own rendition.
	///
	/// Rendition groups are more reliable than codec hints, so they are
	/// consulted first.
	pub fn guess_media_type(&self, variant: &Variant) -> Option<MediaType> {
		// a uri-less member of the VIDEO group means the variant playlist
		// itself carries the video
		if let Some(group) = variant.video.as_deref().and_then(|id| self.find_group(id)) {
			if group.iter().any(|media| media.uri.is_none()) {
				return Some(MediaType::Video);
			}
		}

		// when no AUDIO member is uri-less, the audio is an alternate and
		// the variant carries the video
		let has_audio = variant
			.audio
			.as_deref()
			.and_then(|id| self.find_group(id))
			.is_some_and(|group| group.iter().any(|media| media.uri.is_none()));
		if !has_audio {
			return Some(MediaType::Video);
		}

		if variant.video_codec.is_some() {
			return Some(MediaType::Video);
		}
		if variant.audio_codec.is_some() {
			return Some(MediaType::Audio);
		}

		if variant.width != 0 && variant.height != 0 {
			return Some(MediaType::Video);
		}

		None
	}
}
