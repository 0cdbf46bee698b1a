// std
use std::net::IpAddr;
// crates.io
use url::Host;
// self
use crate::{
	_prelude::*,
	descriptor::{ApiDescriptor, DEFAULT_REFRESH_TOKEN_FIELD},
};

/// Errors raised while constructing or using descriptors.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ApiDescriptorError {
	/// Endpoints must use HTTPS unless they point at the local machine.
	#[error("The {endpoint} endpoint must use HTTPS: {url}.")]
	InsecureEndpoint {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Endpoint URL that failed validation.
		url: String,
	},
	/// The base URL cannot have paths joined onto it.
	#[error("Base URL cannot be used as a base: {url}.")]
	InvalidBaseUrl {
		/// Base URL that failed validation.
		url: String,
	},
	/// Refresh token field names must contain visible characters.
	#[error("Refresh token field name must not be blank.")]
	InvalidRefreshField,
	/// Preemptive refresh windows and timeouts must be positive.
	#[error("The {setting} duration must be positive.")]
	NonPositiveDuration {
		/// Which setting failed validation.
		setting: &'static str,
	},
	/// A relative path could not be joined onto the base URL.
	#[error("Path {path:?} cannot be joined onto the base URL.")]
	InvalidPath {
		/// Path that failed to resolve.
		path: String,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
}

/// Builder for [`ApiDescriptor`] values.
#[derive(Debug)]
pub struct ApiDescriptorBuilder {
	/// Base URL every relative request path is joined onto.
	pub base_url: Url,
	refresh: Option<RefreshLocation>,
	/// JSON field carrying the refresh token.
	pub refresh_token_field: String,
	/// Preemptive refresh window.
	pub preemptive_refresh: Option<Duration>,
	/// Per-request timeout.
	pub request_timeout: Option<Duration>,
}
impl ApiDescriptorBuilder {
	/// Creates a new builder seeded with the provided base URL.
	pub fn new(base_url: Url) -> Self {
		Self {
			base_url,
			refresh: None,
			refresh_token_field: DEFAULT_REFRESH_TOKEN_FIELD.into(),
			preemptive_refresh: None,
			request_timeout: None,
		}
	}

	/// Sets an absolute refresh endpoint.
	pub fn refresh_endpoint(mut self, url: Url) -> Self {
		self.refresh = Some(RefreshLocation::Absolute(url));

		self
	}

	/// Sets the refresh endpoint as a path relative to the base URL.
	pub fn refresh_path(mut self, path: impl Into<String>) -> Self {
		self.refresh = Some(RefreshLocation::Relative(path.into()));

		self
	}

	/// Overrides the JSON field carrying the refresh token.
	pub fn refresh_token_field(mut self, field: impl Into<String>) -> Self {
		self.refresh_token_field = field.into();

		self
	}

	/// Refreshes ahead of time when the access token expires within `window`.
	pub fn preemptive_refresh(mut self, window: Duration) -> Self {
		self.preemptive_refresh = Some(window);

		self
	}

	/// Sets the per-request timeout.
	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = Some(timeout);

		self
	}

	/// Consumes the builder and validates the resulting descriptor.
	pub fn build(self) -> Result<ApiDescriptor, ApiDescriptorError> {
		let mut descriptor = ApiDescriptor {
			base_url: self.base_url,
			refresh_endpoint: None,
			refresh_token_field: self.refresh_token_field.trim().to_owned(),
			preemptive_refresh: self.preemptive_refresh,
			request_timeout: self.request_timeout,
		};

		descriptor.refresh_endpoint = match self.refresh {
			Some(RefreshLocation::Absolute(url)) => Some(url),
			Some(RefreshLocation::Relative(path)) => Some(descriptor.endpoint(&path)?),
			None => None,
		};
		descriptor.validate()?;

		Ok(descriptor)
	}
}

#[derive(Debug)]
enum RefreshLocation {
	Absolute(Url),
	Relative(String),
}

impl ApiDescriptor {
	/// Validates invariants for the descriptor.
	fn validate(&self) -> Result<(), ApiDescriptorError> {
		if self.base_url.cannot_be_a_base() {
			return Err(ApiDescriptorError::InvalidBaseUrl { url: self.base_url.to_string() });
		}
		if self.refresh_token_field.is_empty() {
			return Err(ApiDescriptorError::InvalidRefreshField);
		}

		validate_endpoint("base", &self.base_url)?;

		if let Some(refresh) = self.refresh_endpoint.as_ref() {
			validate_endpoint("refresh", refresh)?;
		}

		validate_positive("preemptive_refresh", self.preemptive_refresh)?;
		validate_positive("request_timeout", self.request_timeout)?;

		Ok(())
	}
}

fn validate_endpoint(name: &'static str, url: &Url) -> Result<(), ApiDescriptorError> {
	if url.scheme() == "https" || (url.scheme() == "http" && is_loopback(url)) {
		Ok(())
	} else {
		Err(ApiDescriptorError::InsecureEndpoint { endpoint: name, url: url.to_string() })
	}
}

fn validate_positive(
	setting: &'static str,
	duration: Option<Duration>,
) -> Result<(), ApiDescriptorError> {
	match duration {
		Some(duration) if !duration.is_positive() =>
			Err(ApiDescriptorError::NonPositiveDuration { setting }),
		_ => Ok(()),
	}
}

fn is_loopback(url: &Url) -> bool {
	match url.host() {
		Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
		Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
		Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
		None => false,
	}
}
