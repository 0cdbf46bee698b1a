//! Client-level error types shared across the executor, refresh gate, and stores.

// self
use crate::{_prelude::*, descriptor::ApiDescriptorError, refresh::RefreshError};

/// Client-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error surfaced to callers of [`ApiClient`](crate::client::ApiClient).
#[derive(Debug, ThisError)]
pub enum Error {
	/// Transport failure (DNS, TCP, TLS, timeout); never triggers a refresh.
	#[error("Network is unreachable.")]
	NetworkUnreachable(#[source] TransportError),
	/// Credentials could not be renewed; the caller must sign the user out.
	#[error("Session expired; sign in again.")]
	SessionExpired {
		/// Why the session could not be recovered.
		#[source]
		reason: ExpiryReason,
	},
	/// Server answered with a non-2xx status other than 401.
	#[error("{}", describe_application_error(.status, .message))]
	Application {
		/// HTTP status code.
		status: u16,
		/// Server-provided message, when the body carried one.
		message: Option<String>,
	},
	/// Caller cancelled the operation before it completed.
	#[error("Request was cancelled.")]
	Cancelled,

	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Credential storage failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Successful response body did not match the expected shape.
	#[error("Response body could not be decoded (HTTP {status}).")]
	Decode {
		/// Structured parsing failure naming the offending field.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
		/// HTTP status of the decoded response.
		status: u16,
	},
}
impl Error {
	/// Returns `true` for connectivity failures.
	pub fn is_network(&self) -> bool {
		matches!(self, Self::NetworkUnreachable(_))
	}

	/// Returns `true` when the caller must force a sign-out.
	pub fn is_session_expired(&self) -> bool {
		matches!(self, Self::SessionExpired { .. })
	}

	/// Returns `true` when the caller cancelled the operation.
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}

	/// HTTP status attached to the error, if any.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Application { status, .. } | Self::Decode { status, .. } => Some(*status),
			_ => None,
		}
	}
}

fn describe_application_error(status: &u16, message: &Option<String>) -> String {
	match message {
		Some(message) => format!("Server responded with HTTP {status}: {message}."),
		None => format!("Server responded with HTTP {status}."),
	}
}

/// Reasons a session is declared expired.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ExpiryReason {
	/// The refresh procedure failed.
	#[error("Token refresh failed.")]
	RefreshFailed(#[source] RefreshError),
	/// The refresh procedure completed without producing an access token.
	#[error("Token refresh produced no access token.")]
	NoToken,
	/// The request was rejected again after replaying it with a refreshed token.
	#[error("Refreshed access token was rejected.")]
	ReplayRejected,
	/// The session was cleared (sign-out or a failed refresh) while the request was in flight.
	#[error("Session was cleared while the request was in flight.")]
	Cleared,
}

/// Configuration and validation failures raised by the client.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// HTTP request could not be constructed.
	#[error("HTTP request could not be constructed.")]
	HttpRequest {
		/// Underlying request builder failure.
		#[source]
		source: BoxError,
	},
	/// Descriptor failed validation or could not resolve a path.
	#[error(transparent)]
	Descriptor(#[from] ApiDescriptorError),
	/// A header value contains bytes that HTTP forbids.
	#[error("The {name} header value is not valid.")]
	InvalidHeader {
		/// Header name that failed validation.
		name: &'static str,
	},
	/// Request body could not be serialized to JSON.
	#[error("Request body could not be serialized to JSON.")]
	Serialize(#[source] serde_json::Error),
	/// Descriptor does not configure a refresh endpoint.
	#[error("Descriptor does not configure a refresh endpoint.")]
	MissingRefreshEndpoint,
	/// OAuth token endpoint cannot be parsed.
	#[error("Token endpoint is invalid.")]
	InvalidTokenEndpoint {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}

/// Transport-level failures (network, IO, request construction).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the API.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the API.")]
	Io(#[from] std::io::Error),
	/// Transport refused to build the request.
	#[error("Transport could not build the request.")]
	Build {
		/// Transport-specific builder error.
		#[source]
		source: BoxError,
	},
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}

	/// Wraps a transport-specific request construction error.
	pub fn build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Build { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		if e.is_builder() { Self::build(e) } else { Self::network(e) }
	}
}
