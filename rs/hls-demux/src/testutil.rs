//! In-memory collaborators injected through the [Fetcher], [Sink] and
//! [Host] contracts by the test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use url::Url;

use crate::demux::Host;
use crate::fetch::{ByteStream, FetchRange, Fetcher};
use crate::sink::{Buffer, Flow, Sink, TrackEvent};
use crate::track::TrackInfo;
use crate::{Error, Result};

/// In-memory fetcher: a map of uri to successive bodies.
///
/// A uri with several bodies serves them in order, sticking to the last one;
/// that is how refresh tests express a growing live playlist. Streams are
/// chopped into `chunk_size` pieces.
pub struct TestFetcher {
	resources: Mutex<HashMap<String, VecDeque<Bytes>>>,
	broken: Mutex<HashMap<String, Bytes>>,
	chunk_size: usize,
}

impl TestFetcher {
	pub fn new(chunk_size: usize) -> Arc<Self> {
		Arc::new(Self {
			resources: Default::default(),
			broken: Default::default(),
			chunk_size: chunk_size.max(1),
		})
	}

	/// Serve `body` for `uri`; repeated calls queue successive versions.
	pub fn serve(&self, uri: &str, body: impl Into<Bytes>) {
		self.resources.lock().entry(uri.to_string()).or_default().push_back(body.into());
	}

	/// Serve a resource whose stream fails after `prefix`.
	pub fn serve_broken(&self, uri: &str, prefix: impl Into<Bytes>) {
		self.broken.lock().insert(uri.to_string(), prefix.into());
	}

	fn body(&self, url: &Url, range: Option<FetchRange>) -> Result<Bytes> {
		let mut resources = self.resources.lock();
		let queue = resources
			.get_mut(url.as_str())
			.filter(|queue| !queue.is_empty())
			.ok_or_else(|| Error::Fetch(format!("no test resource for {url}")))?;

		let body = match queue.len() {
			1 => queue.front().cloned().unwrap(),
			_ => queue.pop_front().unwrap(),
		};

		Ok(match range {
			Some(range) => {
				let end = range.end.map(|end| end as usize).unwrap_or(body.len()).min(body.len());
				body.slice(range.start as usize..end)
			}
			None => body,
		})
	}

	fn chop(&self, body: &Bytes) -> Vec<Result<Bytes>> {
		body.chunks(self.chunk_size).map(|chunk| Ok(Bytes::copy_from_slice(chunk))).collect()
	}
}

#[async_trait::async_trait]
impl Fetcher for TestFetcher {
	async fn fetch(&self, url: &Url, range: Option<FetchRange>) -> Result<Bytes> {
		self.body(url, range)
	}

	async fn stream(&self, url: &Url, range: Option<FetchRange>) -> Result<ByteStream> {
		if let Some(prefix) = self.broken.lock().get(url.as_str()).cloned() {
			let mut items = self.chop(&prefix);
			items.push(Err(Error::Fetch("connection reset".to_string())));
			return Ok(Box::pin(futures::stream::iter(items)));
		}

		let body = self.body(url, range)?;
		Ok(Box::pin(futures::stream::iter(self.chop(&body))))
	}
}

#[derive(Clone, Debug)]
pub enum SinkRecord {
	Buffer(Buffer),
	Event(TrackEvent),
}

/// In-memory downstream sink recording everything it receives.
pub struct TestSink {
	state: watch::Sender<Vec<SinkRecord>>,
	flow: Mutex<Flow>,
}

impl TestSink {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			state: watch::Sender::new(Vec::new()),
			flow: Mutex::new(Flow::Ok),
		})
	}

	/// The flow status returned for every subsequent buffer.
	pub fn set_flow(&self, flow: Flow) {
		*self.flow.lock() = flow;
	}

	pub fn records(&self) -> Vec<SinkRecord> {
		self.state.borrow().clone()
	}

	pub fn buffers(&self) -> Vec<Buffer> {
		self.records()
			.into_iter()
			.filter_map(|record| match record {
				SinkRecord::Buffer(buffer) => Some(buffer),
				SinkRecord::Event(_) => None,
			})
			.collect()
	}

	pub fn events(&self) -> Vec<TrackEvent> {
		self.records()
			.into_iter()
			.filter_map(|record| match record {
				SinkRecord::Event(event) => Some(event),
				SinkRecord::Buffer(_) => None,
			})
			.collect()
	}

	/// The payload bytes received so far, concatenated.
	pub fn payload(&self) -> Vec<u8> {
		self.buffers().iter().flat_map(|buffer| buffer.data.to_vec()).collect()
	}

	/// Wait until `count` end-of-stream events arrived.
	pub async fn wait_for_eos(&self, count: usize) {
		let mut state = self.state.subscribe();
		let received = state.wait_for(|records| {
			records
				.iter()
				.filter(|record| matches!(record, SinkRecord::Event(TrackEvent::Eos)))
				.count() >= count
		});

		tokio::time::timeout(Duration::from_secs(10), received)
			.await
			.expect("timed out waiting for EOS")
			.expect("sink dropped");
	}
}

impl Sink for TestSink {
	fn push_buffer(&self, buffer: Buffer) -> Flow {
		let flow = *self.flow.lock();
		self.state.send_modify(|records| records.push(SinkRecord::Buffer(buffer)));
		flow
	}

	fn push_event(&self, event: TrackEvent) -> Flow {
		self.state.send_modify(|records| records.push(SinkRecord::Event(event)));
		Flow::Ok
	}
}

/// In-memory host: hands every new output a recording [TestSink].
pub struct TestHost {
	uri: Option<Url>,
	outputs: Mutex<Vec<(TrackInfo, Arc<TestSink>)>>,
	errors: Mutex<Vec<Error>>,
	no_more: Mutex<bool>,
}

impl TestHost {
	pub fn new(uri: &str) -> Arc<Self> {
		Arc::new(Self {
			uri: Some(Url::parse(uri).expect("valid test uri")),
			outputs: Default::default(),
			errors: Default::default(),
			no_more: Mutex::new(false),
		})
	}

	pub fn without_uri() -> Arc<Self> {
		Arc::new(Self {
			uri: None,
			outputs: Default::default(),
			errors: Default::default(),
			no_more: Mutex::new(false),
		})
	}

	pub fn outputs(&self) -> Vec<(TrackInfo, Arc<TestSink>)> {
		self.outputs.lock().clone()
	}

	pub fn output(&self, name: &str) -> Arc<TestSink> {
		self.outputs
			.lock()
			.iter()
			.find(|(info, _)| info.name == name)
			.map(|(_, sink)| sink.clone())
			.unwrap_or_else(|| panic!("no output named {name}"))
	}

	pub fn errors(&self) -> Vec<Error> {
		self.errors.lock().clone()
	}

	pub fn saw_no_more_tracks(&self) -> bool {
		*self.no_more.lock()
	}
}

impl Host for TestHost {
	fn source_uri(&self) -> Option<Url> {
		self.uri.clone()
	}

	fn create_output(&self, info: &TrackInfo) -> Arc<dyn Sink> {
		let sink = TestSink::new();
		self.outputs.lock().push((info.clone(), sink.clone()));
		sink
	}

	fn no_more_tracks(&self) {
		*self.no_more.lock() = true;
	}

	fn post_error(&self, error: Error) {
		self.errors.lock().push(error);
	}
}
