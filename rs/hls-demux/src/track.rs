use std::mem;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use url::Url;

use crate::crypto::{derive_iv, CryptoError, SegmentDecryptor, KEY_SIZE};
use crate::demux::Host;
use crate::fetch::{FetchRange, Fetcher};
use crate::playlist::{KeyMethod, MediaPlaylist, MediaType};
use crate::queue::{QueueConsumer, QueueItem, QueueProducer};
use crate::sink::{Buffer, Flow, Sink, StreamFlags, TrackEvent};
use crate::typefind::PayloadKind;
use crate::{Error, Result};

/// Static identity of one demuxer output.
#[derive(Clone, Debug)]
pub struct TrackInfo {
	/// Output name: `video_N`, `audio_N` or `subtitle_N`.
	pub name: String,
	pub media_type: MediaType,
	/// Unique stream id of the form `<parent-stream-id>/NNN`.
	pub stream_id: String,
	/// Group id shared by every track of the demuxer.
	pub group_id: u32,
	pub flags: StreamFlags,
	/// The master playlist this track was selected from.
	pub master_uri: Url,
}

/// A seek request from downstream; positions are in stream time.
#[derive(Clone, Debug)]
pub struct Seek {
	pub rate: f64,
	pub start: Duration,
	pub flags: SeekFlags,
	/// Sequence number of the originating event, used to deduplicate a seek
	/// delivered on several outputs.
	pub seqnum: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SeekFlags {
	pub flush: bool,
	pub key_unit: bool,
	pub snap_before: bool,
	pub snap_after: bool,
}

/// Cursor state advanced by the producer and repositioned by seeks.
///
/// Mutated by the producer task while it runs, and by the control side only
/// while the producer is stopped.
#[derive(Debug)]
struct Cursor {
	/// The next sequence number to download.
	sequence: u64,
	/// Attach a discontinuity flag to the next buffer.
	discont: bool,
	/// Timestamp for the next buffer; only the first buffer after expose or
	/// seek carries one.
	next_pts: Option<Duration>,
	/// Running byte offset since the last flush.
	offset: u64,
	/// The sticky events were emitted.
	exposed: bool,
}

impl Default for Cursor {
	fn default() -> Self {
		Self {
			sequence: 0,
			discont: false,
			next_pts: None,
			offset: 0,
			exposed: false,
		}
	}
}

/// One demuxer output: a producer task downloading and decrypting segments,
/// and a consumer task draining the output queue into the downstream sink.
pub struct Track {
	info: TrackInfo,
	playlist: Arc<Mutex<MediaPlaylist>>,
	cursor: Arc<Mutex<Cursor>>,
	fetcher: Arc<dyn Fetcher>,
	sink: Arc<dyn Sink>,
	host: Arc<dyn Host>,

	queue: QueueProducer,
	producer: Option<JoinHandle<()>>,
	consumer: Option<JoinHandle<()>>,
	stop: watch::Sender<bool>,

	last_seek_seqnum: Option<u32>,
}

impl Track {
	pub(crate) fn new(
		info: TrackInfo,
		playlist: MediaPlaylist,
		fetcher: Arc<dyn Fetcher>,
		sink: Arc<dyn Sink>,
		host: Arc<dyn Host>,
	) -> Self {
		Self {
			info,
			playlist: Arc::new(Mutex::new(playlist)),
			cursor: Arc::new(Mutex::new(Cursor::default())),
			fetcher,
			sink,
			host,
			queue: QueueProducer::new(),
			producer: None,
			consumer: None,
			stop: watch::Sender::new(false),
			last_seek_seqnum: None,
		}
	}

	pub fn info(&self) -> &TrackInfo {
		&self.info
	}

	/// Fetch the playlist unless the coordinator already parsed it, position
	/// the cursor at the head and start the tasks.
	pub(crate) async fn activate(&mut self) -> Result<()> {
		let (uri, parsed) = {
			let playlist = self.playlist.lock();
			(playlist.uri.clone(), playlist.digest().is_some())
		};

		let media_sequence = if parsed {
			debug!(track = %self.info.name, "reusing playlist downloaded upstream");
			self.playlist.lock().media_sequence
		} else {
			let body = self.fetcher.fetch(&uri, None).await?;
			let text = String::from_utf8_lossy(&body);
			let mut playlist = self.playlist.lock();
			playlist.update(&text)?;
			playlist.media_sequence
		};

		{
			let mut cursor = self.cursor.lock();
			cursor.sequence = media_sequence;
			cursor.discont = true;
		}

		self.start();
		Ok(())
	}

	fn start(&mut self) {
		let (stop, stopped) = watch::channel(false);
		self.stop = stop;

		let producer = Producer {
			info: self.info.clone(),
			playlist: self.playlist.clone(),
			cursor: self.cursor.clone(),
			fetcher: self.fetcher.clone(),
			queue: self.queue.clone(),
			host: self.host.clone(),
			stop: stopped,
			decryptor: None,
			key_uri: None,
			key_data: Bytes::new(),
		};
		self.producer = Some(tokio::spawn(producer.run()));

		let consumer = Consumer {
			name: self.info.name.clone(),
			queue: self.queue.consumer(),
			sink: self.sink.clone(),
			host: self.host.clone(),
		};
		self.consumer = Some(tokio::spawn(consumer.run()));
	}

	/// Stop the producer task, cancelling any in-flight fetch, and wait for
	/// it to exit.
	async fn stop_producer(&mut self) {
		let _ = self.stop.send(true);
		if let Some(task) = self.producer.take() {
			let _ = task.await;
		}
	}

	async fn join_consumer(&mut self) {
		if let Some(task) = self.consumer.take() {
			let _ = task.await;
		}
	}

	/// Tear the track down. The queue is left flushing so neither task can
	/// block on the way out.
	pub(crate) async fn stop(&mut self) {
		self.queue.set_flushing(true);
		self.stop_producer().await;
		self.join_consumer().await;
	}

	/// Downstream flush-start: stop the producer and discard queued items.
	pub async fn flush_start(&mut self) {
		debug!(track = %self.info.name, "flush start");
		self.queue.set_flushing(true);
		self.stop_producer().await;
		self.join_consumer().await;
		self.queue.flush();
	}

	/// Downstream flush-stop: accept data again. The next seek restarts the
	/// tasks.
	pub fn flush_stop(&mut self) {
		debug!(track = %self.info.name, "flush stop");
		self.queue.set_flushing(false);
	}

	/// Handle a downstream seek.
	///
	/// Returns `false` when the seek is rejected: negative rates, and any
	/// seek on a live playlist.
	pub async fn handle_seek(&mut self, seek: &Seek) -> bool {
		if self.last_seek_seqnum == Some(seek.seqnum) {
			debug!(track = %self.info.name, "skipping already handled seek");
			return true;
		}

		if seek.rate < 0.0 {
			debug!(track = %self.info.name, "reverse playback is not supported");
			return false;
		}

		if self.playlist.lock().is_live() {
			debug!(track = %self.info.name, "cannot seek in live playlist");
			return false;
		}

		debug!(track = %self.info.name, start = ?seek.start, "handling seek");
		self.last_seek_seqnum = Some(seek.seqnum);

		if seek.flags.flush {
			debug!(track = %self.info.name, "starting flush");
			self.queue.set_flushing(true);
			self.stop_producer().await;
			self.join_consumer().await;
			self.queue.flush();
			self.sink.push_event(TrackEvent::FlushStart { seqnum: seek.seqnum });
		}

		let snap_after = seek.flags.snap_after && !seek.flags.snap_before;

		// walk the segment list to find the one containing the target
		let (position, duration) = {
			let playlist = self.playlist.lock();
			let mut position = seek.start;
			let mut pos = Duration::ZERO;

			for segment in &playlist.segments {
				let clip = if snap_after {
					position <= pos
				} else {
					position >= pos && position < pos + segment.duration
				};

				if clip {
					debug!(
						track = %self.info.name,
						sequence = segment.sequence,
						start = ?pos,
						"found seek sequence"
					);
					self.cursor.lock().sequence = segment.sequence;
					position = pos;
					break;
				}

				pos += segment.duration;
			}

			(position, playlist.endlist.then_some(playlist.duration))
		};

		if seek.flags.flush {
			debug!(track = %self.info.name, "stopping flush");
			self.queue.set_flushing(false);
			self.sink.push_event(TrackEvent::FlushStop { seqnum: seek.seqnum });
		}

		let start = if seek.flags.key_unit { position } else { seek.start };
		let _ = self.queue.push_force(QueueItem::Event(TrackEvent::Segment { start, duration }));

		{
			let mut cursor = self.cursor.lock();
			cursor.discont = true;
			cursor.offset = 0;
			cursor.next_pts = Some(position);
		}

		if seek.flags.flush || self.producer.is_none() {
			self.start();
		}

		true
	}

	/// The master playlist uri this track belongs to.
	pub fn uri(&self) -> &Url {
		&self.info.master_uri
	}

	/// Total duration; answered only for complete or event playlists.
	pub fn duration(&self) -> Option<Duration> {
		let playlist = self.playlist.lock();
		playlist.is_seekable().then_some(playlist.duration)
	}

	/// The seekable range; answered only for complete or event playlists.
	pub fn seekable(&self) -> Option<(Duration, Duration)> {
		let playlist = self.playlist.lock();
		playlist.is_seekable().then_some((Duration::ZERO, playlist.duration))
	}

	/// Merge upstream liveness with this track's.
	pub fn latency(&self, upstream_live: bool) -> bool {
		upstream_live || self.playlist.lock().is_live()
	}
}

enum Step {
	Continue,
	Eos,
}

/// The per-track download loop.
struct Producer {
	info: TrackInfo,
	playlist: Arc<Mutex<MediaPlaylist>>,
	cursor: Arc<Mutex<Cursor>>,
	fetcher: Arc<dyn Fetcher>,
	queue: QueueProducer,
	host: Arc<dyn Host>,
	stop: watch::Receiver<bool>,

	decryptor: Option<SegmentDecryptor>,
	/// Key bytes are cached by uri; the cipher itself is fresh per segment
	/// since the derived IV changes with the sequence number.
	key_uri: Option<Url>,
	key_data: Bytes,
}

/// Wait until the producer is told to stop.
async fn stopped(stop: &watch::Receiver<bool>) {
	let mut stop = stop.clone();
	let _ = stop.wait_for(|stopped| *stopped).await;
}

impl Producer {
	async fn run(mut self) {
		let failure = loop {
			match self.download_next().await {
				Ok(Step::Continue) => continue,
				Ok(Step::Eos) => break None,
				// flush or teardown; exit without an end-of-stream
				Err(Error::Cancelled) | Err(Error::Flushing) => return,
				Err(err) => break Some(err),
			}
		};

		if let Some(err) = failure {
			error!(track = %self.info.name, %err, "track failed");
			if matches!(err, Error::Parse(_)) {
				self.host.post_error(err);
			}
		}

		// emit end-of-stream so the downstream can settle
		let _ = self.queue.push_force(QueueItem::Event(TrackEvent::Eos));
	}

	/// One iteration of the control loop: find the next segment, download
	/// and decrypt it, and advance.
	async fn download_next(&mut self) -> Result<Step> {
		// find the next segment based on the cursor sequence
		let (segment, key) = loop {
			let sequence = self.cursor.lock().sequence;
			let (segment, key, endlist) = {
				let playlist = self.playlist.lock();
				let segment = playlist.get_segment(sequence).cloned();
				let key = segment
					.as_ref()
					.and_then(|segment| playlist.segment_key(segment))
					.cloned();
				(segment, key, playlist.endlist)
			};

			match segment {
				Some(segment) => break (segment, key),
				None if endlist => {
					debug!(track = %self.info.name, "all segments downloaded, sending EOS");
					return Ok(Step::Eos);
				}
				None => {
					if !self.refresh().await? {
						error!(track = %self.info.name, "no more segments in playlist");
						return Ok(Step::Eos);
					}
				}
			}
		};

		// mark a discontinuity when the segment does not continue the
		// previous one
		{
			let mut cursor = self.cursor.lock();
			if cursor.sequence != segment.sequence || segment.discont {
				cursor.discont = true;
			}
			cursor.sequence = segment.sequence;
		}

		// set up decryption when the segment is encrypted
		self.decryptor = None;
		if let Some(key) = &key {
			match (key.method, &key.uri) {
				(KeyMethod::None, _) | (_, None) => {}
				(KeyMethod::Aes128, Some(uri)) => {
					let uri = uri.clone();
					let decryptor = self.init_decryptor(&uri, key.iv.as_deref(), segment.sequence).await?;
					self.decryptor = Some(decryptor);
				}
				(KeyMethod::SampleAes, _) | (KeyMethod::Unknown, _) => {
					error!(track = %self.info.name, "unsupported encryption method");
					return Err(CryptoError::UnsupportedMethod.into());
				}
			}
		}

		debug!(
			track = %self.info.name,
			sequence = segment.sequence,
			range = ?segment.range,
			uri = %segment.uri,
			"downloading segment"
		);

		let range = segment.range.map(FetchRange::from);
		let mut clean = true;

		match self.open_stream(&segment.uri, range).await {
			Ok(mut stream) => loop {
				let chunk = tokio::select! {
					biased;
					_ = stopped(&self.stop) => return Err(Error::Cancelled),
					chunk = stream.next() => chunk,
				};

				match chunk {
					Some(Ok(chunk)) => self.chain(chunk).await?,
					Some(Err(err)) => {
						debug!(track = %self.info.name, %err, "segment download failed");
						clean = false;
						break;
					}
					None => break,
				}
			},
			Err(Error::Cancelled) => return Err(Error::Cancelled),
			Err(err) => {
				debug!(track = %self.info.name, %err, "segment download failed");
				clean = false;
			}
		}

		if !clean {
			// a partial segment breaks continuity but not the track
			self.cursor.lock().discont = true;
		}

		// flush the trailing cipher padding; a partial download has nothing
		// coherent to finalize
		if let Some(decryptor) = self.decryptor.take() {
			if clean {
				let residual = decryptor.finalize().map_err(Error::from)?;
				if !residual.is_empty() {
					self.push_residual(residual).await?;
				}
			}
		}

		// set the next segment to download
		self.cursor.lock().sequence += 1;

		Ok(Step::Continue)
	}

	/// Refetch the playlist; `false` when the body did not change.
	async fn refresh(&mut self) -> Result<bool> {
		let uri = self.playlist.lock().uri.clone();
		debug!(track = %self.info.name, %uri, "updating playlist");

		let body = self.fetch(&uri, None).await?;
		let text = String::from_utf8_lossy(&body);

		Ok(self.playlist.lock().update(&text)?)
	}

	/// Download the key (cached by uri) and initialise the cipher for one
	/// segment.
	async fn init_decryptor(&mut self, uri: &Url, iv: Option<&str>, sequence: u64) -> Result<SegmentDecryptor> {
		if self.key_uri.as_ref() != Some(uri) {
			info!(track = %self.info.name, %uri, "downloading AES-128 key");

			let data = self.fetch(uri, None).await.map_err(|err| match err {
				Error::Cancelled => Error::Cancelled,
				_ => CryptoError::KeyFetch.into(),
			})?;

			if data.len() != KEY_SIZE {
				return Err(CryptoError::KeySize(data.len()).into());
			}

			self.key_data = data;
			self.key_uri = Some(uri.clone());
		}

		let iv = derive_iv(iv, sequence)?;
		Ok(SegmentDecryptor::new(&self.key_data, &iv)?)
	}

	/// Handle one received chunk: decrypt, expose on the first one, tag and
	/// queue.
	async fn chain(&mut self, chunk: Bytes) -> Result<()> {
		let chunk = match self.decryptor.as_mut() {
			Some(decryptor) => decryptor.update(&chunk),
			None => chunk,
		};

		let exposed = self.cursor.lock().exposed;
		if !exposed {
			self.expose(&chunk)?;
		}

		let buffer = {
			let mut cursor = self.cursor.lock();
			let len = chunk.len() as u64;
			let offset = cursor.offset;
			cursor.offset += len;

			Buffer {
				data: chunk,
				pts: cursor.next_pts.take(),
				discont: mem::take(&mut cursor.discont),
				offset,
				offset_end: offset + len,
			}
		};

		self.queue.push(QueueItem::Buffer(buffer)).await
	}

	/// Queue a trailing buffer outside the chain path; it carries neither a
	/// pts nor the pending discontinuity.
	async fn push_residual(&mut self, data: Bytes) -> Result<()> {
		let buffer = {
			let mut cursor = self.cursor.lock();
			let len = data.len() as u64;
			let offset = cursor.offset;
			cursor.offset += len;

			Buffer {
				data,
				pts: None,
				discont: false,
				offset,
				offset_end: offset + len,
			}
		};

		self.queue.push(QueueItem::Buffer(buffer)).await
	}

	/// Classify the payload and emit the sticky events: stream-start, caps,
	/// segment.
	fn expose(&mut self, data: &[u8]) -> Result<()> {
		let kind = PayloadKind::detect(data);
		info!(track = %self.info.name, caps = kind.caps(), "exposing track");

		self.queue.push_force(QueueItem::Event(TrackEvent::StreamStart {
			stream_id: self.info.stream_id.clone(),
			group_id: self.info.group_id,
			flags: self.info.flags,
		}))?;

		self.queue.push_force(QueueItem::Event(TrackEvent::Caps(kind)))?;

		let duration = {
			let playlist = self.playlist.lock();
			playlist.endlist.then_some(playlist.duration)
		};
		self.queue.push_force(QueueItem::Event(TrackEvent::Segment {
			start: Duration::ZERO,
			duration,
		}))?;

		let mut cursor = self.cursor.lock();
		cursor.next_pts = Some(Duration::ZERO);
		cursor.exposed = true;

		Ok(())
	}

	async fn fetch(&self, url: &Url, range: Option<FetchRange>) -> Result<Bytes> {
		tokio::select! {
			biased;
			_ = stopped(&self.stop) => Err(Error::Cancelled),
			result = self.fetcher.fetch(url, range) => result,
		}
	}

	async fn open_stream(&self, url: &Url, range: Option<FetchRange>) -> Result<crate::fetch::ByteStream> {
		tokio::select! {
			biased;
			_ = stopped(&self.stop) => Err(Error::Cancelled),
			result = self.fetcher.stream(url, range) => result,
		}
	}
}

/// The per-track drain loop: pop items and forward them downstream.
struct Consumer {
	name: String,
	queue: QueueConsumer,
	sink: Arc<dyn Sink>,
	host: Arc<dyn Host>,
}

impl Consumer {
	async fn run(mut self) {
		loop {
			let item = match self.queue.pop().await {
				Ok(item) => item,
				Err(_) => {
					debug!(track = %self.name, "pausing, queue flushing");
					return;
				}
			};

			let flow = match item {
				QueueItem::Buffer(buffer) => self.sink.push_buffer(buffer),
				QueueItem::Event(event) => {
					self.sink.push_event(event);
					Flow::Ok
				}
			};

			match flow {
				Flow::Ok => {}
				Flow::NotLinked | Flow::Flushing => {
					debug!(track = %self.name, ?flow, "pausing");
					return;
				}
				Flow::Error => {
					error!(track = %self.name, "stream stopped, downstream flow error");
					self.host.post_error(Error::Flow);
					return;
				}
			}
		}
	}
}
