use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use hls_demux::{ByteStream, Error, FetchRange, Fetcher, Result};
use url::Url;

/// Command-line configuration for the HTTP fetcher.
#[derive(clap::Args, Clone, Debug)]
pub struct FetchConfig {
	/// Timeout for each request, in seconds. Zero disables the timeout.
	#[arg(long = "fetch-timeout", default_value_t = 30)]
	pub timeout: u64,
}

impl Default for FetchConfig {
	fn default() -> Self {
		Self { timeout: 30 }
	}
}

impl FetchConfig {
	pub fn init(&self) -> Result<HttpFetcher> {
		HttpFetcher::new(self)
	}
}

/// A [Fetcher] backed by reqwest.
pub struct HttpFetcher {
	client: reqwest::Client,
}

impl HttpFetcher {
	pub fn new(config: &FetchConfig) -> Result<Self> {
		let mut builder =
			reqwest::Client::builder().user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));

		if config.timeout > 0 {
			builder = builder.timeout(Duration::from_secs(config.timeout));
		}

		let client = builder
			.build()
			.map_err(|err| Error::Fetch(format!("failed to build HTTP client: {err}")))?;

		Ok(Self { client })
	}

	async fn request(&self, url: &Url, range: Option<FetchRange>) -> Result<reqwest::Response> {
		tracing::debug!(%url, ?range, "downloading");

		let mut request = self.client.get(url.clone());
		if let Some(range) = range {
			request = request.header(reqwest::header::RANGE, range_header(&range));
		}

		let response = request
			.send()
			.await
			.map_err(|err| Error::Fetch(format!("failed to download {url}: {err}")))?;

		response
			.error_for_status()
			.map_err(|err| Error::Fetch(format!("request for {url} failed: {err}")))
	}
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
	async fn fetch(&self, url: &Url, range: Option<FetchRange>) -> Result<Bytes> {
		let response = self.request(url, range).await?;

		response
			.bytes()
			.await
			.map_err(|err| Error::Fetch(format!("failed to read body from {url}: {err}")))
	}

	async fn stream(&self, url: &Url, range: Option<FetchRange>) -> Result<ByteStream> {
		let response = self.request(url, range).await?;

		let stream = response
			.bytes_stream()
			.map_err(|err| Error::Fetch(format!("segment stream failed: {err}")));

		Ok(Box::pin(stream))
	}
}

/// Format an HTTP `Range` header value; the wire format is inclusive.
fn range_header(range: &FetchRange) -> String {
	match range.end {
		Some(end) => format!("bytes={}-{}", range.start, end.saturating_sub(1)),
		None => format!("bytes={}-", range.start),
	}
}
