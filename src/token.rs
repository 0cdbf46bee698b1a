//! Observable access-token state decoupled from any UI framework.

// std
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use tokio::sync::watch;
// self
use crate::{
	_prelude::*,
	auth::TokenSecret,
	refresh::{RefreshOutcome, Refresher},
};

/// Holds the current access token and the procedure that renews it.
///
/// The token lives in a [`watch`] channel, so any number of observers can follow sign-in,
/// refresh, and sign-out through [`TokenStore::subscribe`] without polling. The store does not
/// coordinate concurrent refreshes itself; route them through a
/// [`RefreshGate`](crate::refresh::RefreshGate).
pub struct TokenStore {
	current: watch::Sender<Option<TokenSecret>>,
	epoch: AtomicU64,
	refresher: Arc<dyn Refresher>,
}
impl TokenStore {
	/// Creates an empty store that renews tokens through `refresher`.
	pub fn new(refresher: Arc<dyn Refresher>) -> Self {
		let (current, _) = watch::channel(None);

		Self { current, epoch: AtomicU64::new(0), refresher }
	}

	/// Returns the current access token, if any.
	pub fn get_token(&self) -> Option<TokenSecret> {
		self.current.borrow().clone()
	}

	/// Replaces the current access token.
	pub fn set_token(&self, token: TokenSecret) {
		self.current.send_replace(Some(token));
	}

	/// Drops the current access token. Clearing an empty store notifies no one.
	///
	/// Every call advances [`TokenStore::epoch`], including calls on an empty store.
	pub fn clear(&self) {
		self.epoch.fetch_add(1, Ordering::SeqCst);
		self.current.send_if_modified(|slot| slot.take().is_some());
	}

	/// Number of times the store has been cleared.
	///
	/// Requests capture it before sending so a session ended while they were in flight is
	/// recognized even when they carried no token.
	pub fn epoch(&self) -> u64 {
		self.epoch.load(Ordering::SeqCst)
	}

	/// Subscribes to token changes; the receiver starts out seeing the current value.
	pub fn subscribe(&self) -> watch::Receiver<Option<TokenSecret>> {
		self.current.subscribe()
	}

	/// Runs the refresh procedure once and stores the token it produces.
	///
	/// Failures leave the current token untouched; deciding whether to sign out is up to the
	/// caller.
	pub async fn refresh(&self) -> RefreshOutcome {
		let outcome = self.refresher.refresh().await;

		if let Ok(Some(token)) = &outcome {
			self.set_token(token.clone());
		}

		outcome
	}
}
impl Debug for TokenStore {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenStore")
			.field("token_set", &self.current.borrow().is_some())
			.finish_non_exhaustive()
	}
}
