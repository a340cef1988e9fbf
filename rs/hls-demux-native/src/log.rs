use tracing_subscriber::EnvFilter;

/// Logging configuration, initialised once at startup.
#[derive(clap::Args, Clone, Debug)]
pub struct Log {
	/// The default log level; `RUST_LOG` takes precedence.
	#[arg(long = "log-level", default_value = "info")]
	pub level: String,
}

impl Default for Log {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
		}
	}
}

impl Log {
	pub fn init(&self) {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

		tracing_subscriber::fmt().with_env_filter(filter).init();
	}
}
