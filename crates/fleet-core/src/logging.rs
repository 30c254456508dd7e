//! Tracing/logging bootstrap, shared by the binary and by integration tests
//! that want readable output. Format and level both come from the
//! environment so the same binary is quiet in a unit test and verbose under
//! `RUST_LOG=debug` in an operator's terminal.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
	/// Human-readable, multi-line. Default for local development.
	Pretty,
	/// One JSON object per line. Used in production so the log shipper
	/// doesn't need to parse free text.
	Json,
}

impl LogFormat {
	fn from_env() -> Self {
		match std::env::var("LOG_FORMAT").as_deref() {
			Ok("json") => LogFormat::Json,
			_ => LogFormat::Pretty,
		}
	}
}

/// Installs the global tracing subscriber. Idempotent-safe to call more
/// than once in tests via `try_init`, which silently no-ops if a subscriber
/// is already installed.
pub fn init() {
	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	match LogFormat::from_env() {
		LogFormat::Json => {
			let _ = tracing_subscriber::registry()
				.with(env_filter)
				.with(fmt::layer().json().with_current_span(false))
				.try_init();
		},
		LogFormat::Pretty => {
			let _ = tracing_subscriber::registry()
				.with(env_filter)
				.with(fmt::layer().with_target(true))
				.try_init();
		},
	}
}
