//! Thread-safe in-memory [`CredentialStore`] for tests and ephemeral sessions.

// self
use crate::{
	_prelude::*,
	auth::Credentials,
	store::{self, CompareAndSwapOutcome, CredentialStore, StoreFuture},
};

type Slot = Arc<RwLock<Option<Credentials>>>;

/// Keeps the session in-process; nothing survives a restart.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(Slot);
impl MemoryStore {
	/// Creates a store that already holds `credentials`.
	pub fn with_credentials(credentials: Credentials) -> Self {
		Self(Arc::new(RwLock::new(Some(credentials))))
	}

	fn cas_now(
		slot: Slot,
		expected_refresh: Option<&str>,
		replacement: Credentials,
	) -> CompareAndSwapOutcome {
		let mut guard = slot.write();
		let outcome = match guard.as_ref() {
			Some(existing) if store::refresh_matches(existing.refresh_secret(), expected_refresh) =>
				CompareAndSwapOutcome::Updated,
			Some(_) => CompareAndSwapOutcome::RefreshMismatch,
			None => CompareAndSwapOutcome::Missing,
		};

		if matches!(outcome, CompareAndSwapOutcome::Updated) {
			*guard = Some(replacement);
		}

		outcome
	}
}
impl CredentialStore for MemoryStore {
	fn load(&self) -> StoreFuture<'_, Option<Credentials>> {
		let slot = self.0.clone();

		Box::pin(async move { Ok(slot.read().clone()) })
	}

	fn save(&self, credentials: Credentials) -> StoreFuture<'_, ()> {
		let slot = self.0.clone();

		Box::pin(async move {
			*slot.write() = Some(credentials);

			Ok(())
		})
	}

	fn compare_and_swap_refresh<'a>(
		&'a self,
		expected_refresh: Option<&'a str>,
		replacement: Credentials,
	) -> StoreFuture<'a, CompareAndSwapOutcome> {
		let slot = self.0.clone();

		Box::pin(async move { Ok(Self::cas_now(slot, expected_refresh, replacement)) })
	}

	fn clear(&self) -> StoreFuture<'_, Option<Credentials>> {
		let slot = self.0.clone();

		Box::pin(async move { Ok(slot.write().take()) })
	}
}
