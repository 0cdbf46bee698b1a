//! API descriptor: the validated configuration an [`ApiClient`](crate::client::ApiClient) runs
//! against.

/// Builder API for assembling API descriptors.
pub mod builder;

pub use builder::*;

// self
use crate::_prelude::*;

/// Field name used for the refresh credential when none is configured.
pub const DEFAULT_REFRESH_TOKEN_FIELD: &str = "refresh_token";

/// Immutable description of the backend consumed by the client and the refresh procedures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiDescriptor {
	/// Base URL every relative request path is joined onto.
	pub base_url: Url,
	/// Endpoint that exchanges a refresh token for a new access token.
	pub refresh_endpoint: Option<Url>,
	/// JSON field carrying the refresh token in refresh requests.
	pub refresh_token_field: String,
	/// Refresh ahead of time when the access token expires within this window.
	pub preemptive_refresh: Option<Duration>,
	/// Per-request timeout applied by transports built from this descriptor.
	pub request_timeout: Option<Duration>,
}
impl ApiDescriptor {
	/// Creates a new builder for the provided base URL.
	pub fn builder(base_url: Url) -> ApiDescriptorBuilder {
		ApiDescriptorBuilder::new(base_url)
	}

	/// Resolves `path` relative to the base URL.
	///
	/// A leading `/` does not discard the base URL's own path, so `"/v1/items"` against
	/// `https://api.example.com/app` yields `https://api.example.com/app/v1/items`.
	pub fn endpoint(&self, path: &str) -> Result<Url, ApiDescriptorError> {
		let mut base = self.base_url.clone();

		if !base.path().ends_with('/') {
			let with_slash = format!("{}/", base.path());

			base.set_path(&with_slash);
		}

		base.join(path.trim_start_matches('/'))
			.map_err(|source| ApiDescriptorError::InvalidPath { path: path.to_owned(), source })
	}
}
