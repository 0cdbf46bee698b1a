//! Storage contracts and built-in stores for the long-lived session credentials.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// self
use crate::{_prelude::*, auth::Credentials};

/// Boxed future returned by [`CredentialStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Storage backend holding the signed-in session's credentials.
///
/// Implementations are expected to keep the refresh token somewhere secure; the client only
/// reads it while a refresh is in flight and never logs it.
pub trait CredentialStore
where
	Self: Send + Sync,
{
	/// Returns the stored credentials, if a session exists.
	fn load(&self) -> StoreFuture<'_, Option<Credentials>>;

	/// Persists or replaces the stored credentials.
	fn save(&self, credentials: Credentials) -> StoreFuture<'_, ()>;

	/// Atomically replaces the credentials if the stored refresh secret matches `expected_refresh`.
	fn compare_and_swap_refresh<'a>(
		&'a self,
		expected_refresh: Option<&'a str>,
		replacement: Credentials,
	) -> StoreFuture<'a, CompareAndSwapOutcome>;

	/// Removes the stored credentials, returning what was removed. Clearing an empty store is a
	/// no-op.
	fn clear(&self) -> StoreFuture<'_, Option<Credentials>>;
}

/// Result of a refresh-token compare-and-swap attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareAndSwapOutcome {
	/// The refresh secret matched the expected value and the credentials were replaced.
	Updated,
	/// Credentials exist but the refresh secret changed underneath the caller.
	RefreshMismatch,
	/// No session is stored.
	Missing,
}

/// Error type produced by [`CredentialStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}

pub(crate) fn refresh_matches(current: Option<&str>, expected: Option<&str>) -> bool {
	match (current, expected) {
		(None, None) => true,
		(Some(cur), Some(exp)) => cur == exp,
		_ => false,
	}
}
