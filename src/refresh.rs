//! Refresh procedures and the single-flight gate that serializes them.
//!
//! A [`Refresher`] exchanges the long-lived credential for a new access token. Callers never
//! invoke it directly: [`TokenStore::refresh`](crate::token::TokenStore::refresh) runs it, and
//! the [`RefreshGate`] makes sure only one such run is in flight while every other request that
//! hit a 401 waits for the same outcome.

pub mod endpoint;
#[cfg(feature = "reqwest")] pub mod oauth;

mod gate;
mod metrics;

pub use endpoint::EndpointRefresher;
pub use gate::RefreshGate;
pub use metrics::RefreshMetrics;
#[cfg(feature = "reqwest")] pub use oauth::OAuth2Refresher;

// self
use crate::{
	_prelude::*,
	auth::{Credentials, TokenSecret},
	store::{CompareAndSwapOutcome, CredentialStore, StoreError},
};

/// Outcome shared by the refresh initiator and every queued waiter.
///
/// `Ok(None)` means the procedure finished without producing a token.
pub type RefreshOutcome = Result<Option<TokenSecret>, RefreshError>;

/// Boxed future returned by [`Refresher::refresh`].
pub type RefreshFuture<'a> = Pin<Box<dyn Future<Output = RefreshOutcome> + 'a + Send>>;

/// Exchanges a long-lived credential for a fresh access token.
pub trait Refresher
where
	Self: Send + Sync,
{
	/// Runs one refresh attempt.
	fn refresh(&self) -> RefreshFuture<'_>;
}

/// Refresh failures. Cloneable because one failure is fanned out to every waiter.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum RefreshError {
	/// No refresh token is stored, so there is nothing to exchange.
	#[error("No refresh token is stored.")]
	MissingRefreshToken,
	/// The backend rejected the refresh credential; the stored session was discarded.
	#[error("Refresh credential was rejected: {reason}.")]
	Rejected {
		/// HTTP status, when the rejection came with one.
		status: Option<u16>,
		/// Backend- or client-supplied reason string.
		reason: String,
	},
	/// The refresh endpoint failed without judging the credential.
	#[error("Refresh endpoint is unavailable (HTTP {status}).")]
	Unavailable {
		/// HTTP status returned by the endpoint.
		status: u16,
	},
	/// The refresh endpoint could not be reached.
	#[error("Refresh endpoint is unreachable: {message}.")]
	Network {
		/// Transport error summary.
		message: String,
	},
	/// The refresh endpoint answered with a payload the client cannot use.
	#[error("Refresh response is malformed: {message}.")]
	Malformed {
		/// Parsing failure summary, including the offending field path.
		message: String,
	},
	/// Credential storage failed during the refresh.
	#[error(transparent)]
	Storage(#[from] StoreError),
	/// The refresh was dropped before it settled, or the waiter stopped waiting.
	#[error("Refresh was abandoned before it settled.")]
	Abandoned,
}
impl RefreshError {
	/// Returns `true` when the backend judged the credential invalid.
	pub fn is_rejection(&self) -> bool {
		matches!(self, Self::Rejected { .. })
	}
}

/// Stores `rotated` if the session still carries `expected_refresh` and returns the access token
/// callers should use.
///
/// Losing the race to another rotation adopts the winner's token; a session that disappeared
/// mid-refresh (sign-out) yields no token.
pub(crate) async fn persist_rotation(
	store: &dyn CredentialStore,
	expected_refresh: &str,
	rotated: Credentials,
) -> RefreshOutcome {
	let token = rotated.access_token.clone();

	match store.compare_and_swap_refresh(Some(expected_refresh), rotated).await? {
		CompareAndSwapOutcome::Updated => Ok(Some(token)),
		CompareAndSwapOutcome::Missing => Ok(None),
		CompareAndSwapOutcome::RefreshMismatch =>
			Ok(store.load().await?.map(|winner| winner.access_token)),
	}
}

/// Flattens an error and its sources into one line.
pub(crate) fn describe_chain(e: &dyn StdError) -> String {
	let mut parts = vec![e.to_string().trim_end_matches('.').to_owned()];
	let mut source = e.source();

	while let Some(inner) = source {
		parts.push(inner.to_string().trim_end_matches('.').to_owned());

		source = inner.source();
	}

	parts.join(": ")
}
