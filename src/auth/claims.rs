//! Unverified JWT claim inspection.
//!
//! Access tokens are opaque to the client; when a backend happens to issue JWTs, the payload
//! segment still carries useful expiry hints. [`TokenClaims::peek`] decodes that segment without
//! checking the signature, so the result must only drive scheduling decisions (such as refreshing
//! ahead of expiry) and never authorization.

// crates.io
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
// self
use crate::{_prelude::*, auth::TokenSecret};

/// Errors raised while peeking at a token's claims.
#[derive(Debug, ThisError)]
pub enum ClaimsError {
	/// Token does not have the three dot-separated JWT segments.
	#[error("Token is not a JWT.")]
	NotAJwt,
	/// Payload segment is not valid base64url.
	#[error("JWT payload is not valid base64url.")]
	Encoding(#[from] base64::DecodeError),
	/// Payload segment is not the expected JSON object.
	#[error("JWT payload is malformed.")]
	Payload(#[from] serde_path_to_error::Error<serde_json::Error>),
	/// A timestamp claim is outside the representable range.
	#[error("The {claim} claim is out of range.")]
	TimestampOutOfRange {
		/// Claim name.
		claim: &'static str,
	},
}

#[derive(Deserialize)]
struct RawClaims {
	#[serde(default)]
	sub: Option<String>,
	#[serde(default)]
	exp: Option<i64>,
	#[serde(default)]
	iat: Option<i64>,
}

/// Registered claims read from an access token without verification.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenClaims {
	/// Subject the token was issued for.
	pub subject: Option<String>,
	/// Expiry instant (`exp`).
	pub expires_at: Option<OffsetDateTime>,
	/// Issued-at instant (`iat`).
	pub issued_at: Option<OffsetDateTime>,
}
impl TokenClaims {
	/// Decodes the payload segment of `token`.
	pub fn peek(token: &TokenSecret) -> Result<Self, ClaimsError> {
		let mut segments = token.expose().split('.');
		let (Some(_header), Some(payload), Some(_signature), None) =
			(segments.next(), segments.next(), segments.next(), segments.next())
		else {
			return Err(ClaimsError::NotAJwt);
		};
		let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
		let raw: RawClaims =
			serde_path_to_error::deserialize(&mut serde_json::Deserializer::from_slice(&bytes))?;

		Ok(Self {
			subject: raw.sub,
			expires_at: raw.exp.map(|secs| timestamp("exp", secs)).transpose()?,
			issued_at: raw.iat.map(|secs| timestamp("iat", secs)).transpose()?,
		})
	}

	/// Returns `true` when the token expires at or before `now + window`.
	///
	/// Tokens without an `exp` claim never report as expiring.
	pub fn expires_within(&self, now: OffsetDateTime, window: Duration) -> bool {
		self.expires_at.is_some_and(|expires_at| expires_at - now <= window)
	}
}

fn timestamp(claim: &'static str, secs: i64) -> Result<OffsetDateTime, ClaimsError> {
	OffsetDateTime::from_unix_timestamp(secs).map_err(|_| ClaimsError::TimestampOutOfRange { claim })
}
