//! Typed error seams for the components that need to match on a specific
//! error kind (identity checks, cache parsing, namespace setup). Everything
//! above this layer is propagated as `color_eyre::Result`.

#[derive(thiserror::Error, Debug)]
pub enum AimagerError {
	#[error("environment check failed: {0}")]
	Environment(String),

	#[error("configuration error: {0}")]
	Configuration(String),

	#[error("failed to fetch {url}: {source}")]
	Network { url: String, #[source] source: std::io::Error },

	#[error("failed to parse {what}: {reason}")]
	Parsing { what: String, reason: String },

	#[error("subprocess `{command}` exited with {status}")]
	Subprocess { command: String, status: String },

	#[error("namespace setup failed: {0}")]
	Namespace(String),

	#[error("package `{name}` not found in repo `{repo}`")]
	PackageNotFound { repo: String, name: String },

	#[error("{0}")]
	Io(#[from] std::io::Error),

	#[error("{0}")]
	Other(String),
}

impl AimagerError {
	#[must_use]
	pub fn configuration(msg: impl Into<String>) -> Self {
		Self::Configuration(msg.into())
	}

	#[must_use]
	pub fn environment(msg: impl Into<String>) -> Self {
		Self::Environment(msg.into())
	}

	#[must_use]
	pub fn namespace(msg: impl Into<String>) -> Self {
		Self::Namespace(msg.into())
	}

	#[must_use]
	pub fn parsing(what: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::Parsing { what: what.into(), reason: reason.into() }
	}

	#[must_use]
	pub fn subprocess(command: impl Into<String>, status: impl std::fmt::Display) -> Self {
		Self::Subprocess { command: command.into(), status: status.to_string() }
	}
}

/// Helper for `Network` variant construction where we still have a path, not
/// just a URL (mirrors call sites that fetch to a cache path).
#[must_use]
pub fn network_err(url: &str, path: &std::path::Path, source: std::io::Error) -> AimagerError {
	tracing::debug!(?path, "network error while writing cache entry");
	AimagerError::Network { url: url.to_owned(), source }
}
