//! Session credentials persisted between launches.

// self
use crate::{_prelude::*, auth::TokenSecret};

/// Access/refresh token pair issued at sign-in and rotated by refreshes.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
	/// Short-lived bearer token attached to API calls.
	pub access_token: TokenSecret,
	/// Long-lived credential exchanged for new access tokens.
	pub refresh_token: Option<TokenSecret>,
	/// Instant the access token was issued (or stored, when the backend does not say).
	pub issued_at: OffsetDateTime,
	/// Access token expiry, when the backend reports one.
	pub expires_at: Option<OffsetDateTime>,
}
impl Credentials {
	/// Creates credentials for `access_token`, stamped with the current clock.
	pub fn new(access_token: impl Into<String>) -> Self {
		Self {
			access_token: TokenSecret::new(access_token),
			refresh_token: None,
			issued_at: OffsetDateTime::now_utc(),
			expires_at: None,
		}
	}

	/// Attaches the long-lived refresh token.
	pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
		self.refresh_token = Some(TokenSecret::new(token));

		self
	}

	/// Overrides the issued-at instant.
	pub fn with_issued_at(mut self, instant: OffsetDateTime) -> Self {
		self.issued_at = instant;

		self
	}

	/// Sets an absolute expiry instant.
	pub fn with_expires_at(mut self, instant: OffsetDateTime) -> Self {
		self.expires_at = Some(instant);

		self
	}

	/// Sets the expiry relative to the issued-at instant.
	pub fn with_expires_in(mut self, duration: Duration) -> Self {
		self.expires_at = Some(self.issued_at + duration);

		self
	}

	/// Returns `true` when the access token is known to be expired at `instant`.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		self.expires_at.is_some_and(|expires_at| instant >= expires_at)
	}

	/// Produces the credentials that replace `self` after a successful refresh.
	///
	/// Backends that do not rotate the refresh token keep the current one.
	pub fn rotate(
		&self,
		access_token: impl Into<String>,
		refresh_token: Option<String>,
		expires_in: Option<Duration>,
	) -> Self {
		let issued_at = OffsetDateTime::now_utc();

		Self {
			access_token: TokenSecret::new(access_token),
			refresh_token: refresh_token.map(TokenSecret::new).or_else(|| self.refresh_token.clone()),
			issued_at,
			expires_at: expires_in.map(|delta| issued_at + delta),
		}
	}

	/// Refresh secret as a plain string, if present.
	pub fn refresh_secret(&self) -> Option<&str> {
		self.refresh_token.as_ref().map(TokenSecret::expose)
	}
}
impl Debug for Credentials {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Credentials")
			.field("access_token", &"<redacted>")
			.field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros;
	// self
	use super::*;

	#[test]
	fn rotation_keeps_refresh_token_when_backend_omits_it() {
		let current = Credentials::new("access-old").with_refresh_token("refresh-old");
		let rotated = current.rotate("access-new", None, Some(Duration::minutes(15)));

		assert_eq!(rotated.access_token.expose(), "access-new");
		assert_eq!(rotated.refresh_secret(), Some("refresh-old"));
		assert_eq!(rotated.expires_at, Some(rotated.issued_at + Duration::minutes(15)));

		let rotated = current.rotate("access-new", Some("refresh-new".into()), None);

		assert_eq!(rotated.refresh_secret(), Some("refresh-new"));
		assert_eq!(rotated.expires_at, None);
	}

	#[test]
	fn expiry_helpers_follow_the_clock() {
		let credentials = Credentials::new("access")
			.with_issued_at(macros::datetime!(2025-01-01 00:00 UTC))
			.with_expires_in(Duration::hours(1));

		assert!(!credentials.is_expired_at(macros::datetime!(2025-01-01 00:59 UTC)));
		assert!(credentials.is_expired_at(macros::datetime!(2025-01-01 01:00 UTC)));
		assert!(!Credentials::new("forever").is_expired_at(OffsetDateTime::now_utc()));
	}

	#[test]
	fn debug_output_redacts_secrets() {
		let rendered = format!("{:?}", Credentials::new("access").with_refresh_token("refresh"));

		assert!(!rendered.contains("access\""));
		assert!(!rendered.contains("refresh\""));
		assert!(rendered.contains("<redacted>"));
	}
}
