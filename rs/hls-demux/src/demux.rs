use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::fetch::Fetcher;
use crate::playlist::{MasterPlaylist, MediaPlaylist, MediaType};
use crate::sink::{Sink, StreamFlags};
use crate::track::{Seek, Track, TrackInfo};
use crate::{Error, Result};

/// Media type accepted on the inbound playlist channel.
pub const SINK_CAPS: &str = "application/x-hls";

/// Integration surface provided by the host pipeline.
///
/// The demuxer calls back into the host to resolve the inbound playlist uri,
/// to create one downstream sink per track, and to report element-level
/// errors.
pub trait Host: Send + Sync {
	/// The uri the inbound playlist was fetched from; the base for every
	/// relative uri in it.
	fn source_uri(&self) -> Option<Url>;

	/// The upstream stream id, if the peer provided one. Track stream ids
	/// are derived from it.
	fn stream_id(&self) -> Option<String> {
		None
	}

	/// The upstream group id, if the peer provided one.
	fn group_id(&self) -> Option<u32> {
		None
	}

	/// Create the downstream sink for a new output.
	fn create_output(&self, info: &TrackInfo) -> Arc<dyn Sink>;

	/// All outputs for this presentation have been created.
	fn no_more_tracks(&self) {}

	/// A fatal element-level error: a playlist parse failure or a
	/// downstream flow error.
	fn post_error(&self, error: Error);
}

// group ids are allocated process-wide so that two demuxers never share one
static NEXT_GROUP_ID: AtomicU32 = AtomicU32::new(0);

fn next_group_id() -> u32 {
	NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// The demultiplexer: accumulates the inbound playlist, selects a variant
/// and fans out one [Track] per selected rendition.
pub struct Demux {
	fetcher: Arc<dyn Fetcher>,
	host: Arc<dyn Host>,

	pending: BytesMut,
	master: Option<MasterPlaylist>,
	tracks: Vec<Track>,

	num_audio: u32,
	num_video: u32,
	num_subtitle: u32,
	last_stream_id: u32,
}

impl Demux {
	pub fn new(fetcher: Arc<dyn Fetcher>, host: Arc<dyn Host>) -> Self {
		Self {
			fetcher,
			host,
			pending: BytesMut::new(),
			master: None,
			tracks: Vec::new(),
			num_audio: 0,
			num_video: 0,
			num_subtitle: 0,
			last_stream_id: 0,
		}
	}

	/// Accumulate inbound playlist bytes until end-of-input.
	pub fn push(&mut self, data: Bytes) {
		self.pending.extend_from_slice(&data);
	}

	/// The parsed master playlist, available after [Self::end_of_input].
	pub fn master(&self) -> Option<&MasterPlaylist> {
		self.master.as_ref()
	}

	pub fn tracks(&self) -> &[Track] {
		&self.tracks
	}

	pub fn tracks_mut(&mut self) -> &mut [Track] {
		&mut self.tracks
	}

	/// End of the inbound playlist: parse it, select the highest-bandwidth
	/// variant, create a track for it plus one per uri-bearing alternate
	/// rendition, and start them all.
	pub async fn end_of_input(&mut self) -> Result<()> {
		if self.pending.is_empty() {
			warn!("received end of input without a playlist");
		}

		let uri = self.host.source_uri().ok_or(Error::MissingUri)?;
		info!(%uri, "parsing master playlist");

		let data = mem::take(&mut self.pending).freeze();
		let text = String::from_utf8_lossy(&data);

		let mut master = match MasterPlaylist::parse(uri, &text) {
			Ok(master) => master,
			Err(err) => {
				let err = Error::from(err);
				self.host.post_error(err.clone());
				return Err(err);
			}
		};

		// select the variant with the highest bandwidth
		let Some(selected) = master.select_variant(0) else {
			error!("failed to select a variant to render");
			return Err(Error::NoVariant);
		};
		info!(bandwidth = master.variants[selected].bandwidth, "selected variant");

		let parent_id = self.host.stream_id().unwrap_or_else(|| master.uri.to_string());
		let group_id = self.host.group_id().unwrap_or_else(next_group_id);
		let master_uri = master.uri.clone();

		// the variant's own rendition
		match master.guess_media_type(&master.variants[selected]) {
			Some(media_type) => {
				if let Some(playlist) = master.variants[selected].playlist.take() {
					self.add_track(
						media_type,
						StreamFlags::default(),
						playlist,
						&parent_id,
						group_id,
						&master_uri,
					);
				}
			}
			None => debug!("cannot determine the variant stream type"),
		}

		// one track per uri-bearing alternate rendition in the variant's
		// video, audio and subtitles groups
		let group_ids: Vec<String> = {
			let variant = &master.variants[selected];
			[&variant.video, &variant.audio, &variant.subtitles]
				.into_iter()
				.flatten()
				.cloned()
				.collect()
		};

		for id in &group_ids {
			let Some(group) = master.groups.get_mut(id) else { continue };

			for rendition in group {
				let Some(playlist) = rendition.playlist.take() else { continue };

				info!(
					name = rendition.name.as_deref().unwrap_or_default(),
					language = rendition.language.as_deref().unwrap_or_default(),
					"adding rendition output"
				);

				let flags = StreamFlags {
					sparse: rendition.media_type == MediaType::Subtitles,
					select: rendition.is_default,
				};
				self.add_track(rendition.media_type, flags, playlist, &parent_id, group_id, &master_uri);
			}
		}

		self.master = Some(master);
		self.host.no_more_tracks();

		// activate each track; a failed one is left dead but does not tear
		// the demuxer down
		for track in &mut self.tracks {
			if let Err(err) = track.activate().await {
				error!(track = %track.info().name, %err, "failed to activate track");
				if matches!(err, Error::Parse(_)) {
					self.host.post_error(err);
				}
			}
		}

		Ok(())
	}

	fn add_track(
		&mut self,
		media_type: MediaType,
		flags: StreamFlags,
		playlist: MediaPlaylist,
		parent_id: &str,
		group_id: u32,
		master_uri: &Url,
	) {
		let name = match media_type {
			MediaType::Audio => {
				let name = format!("audio_{}", self.num_audio);
				self.num_audio += 1;
				name
			}
			MediaType::Video => {
				let name = format!("video_{}", self.num_video);
				self.num_video += 1;
				name
			}
			MediaType::Subtitles => {
				let name = format!("subtitle_{}", self.num_subtitle);
				self.num_subtitle += 1;
				name
			}
		};

		let stream_id = format!("{parent_id}/{:03}", self.last_stream_id);
		self.last_stream_id += 1;

		let info = TrackInfo {
			name,
			media_type,
			stream_id,
			group_id,
			flags,
			master_uri: master_uri.clone(),
		};

		info!(name = %info.name, "adding output");
		let sink = self.host.create_output(&info);

		self.tracks
			.push(Track::new(info, playlist, self.fetcher.clone(), sink, self.host.clone()));
	}

	/// Fan a downstream seek out to every track; the seqnum deduplicates a
	/// seek already handled on another output.
	pub async fn seek(&mut self, seek: &Seek) -> bool {
		let mut handled = false;
		for track in &mut self.tracks {
			handled |= track.handle_seek(seek).await;
		}
		handled
	}

	/// Tear all tracks down.
	pub async fn stop(&mut self) {
		debug!("stopping downloads");
		for track in &mut self.tracks {
			track.stop().await;
		}
		self.tracks.clear();
	}
}
