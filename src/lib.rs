//! Bearer-authenticated API client that coalesces token refreshes into a single flight,
//! replays rejected requests once, and keeps credentials in pluggable stores.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod client;
pub mod descriptor;
pub mod error;
pub mod http;
pub mod obs;
pub mod refresh;
pub mod store;
pub mod token;
#[cfg(feature = "reqwest")]
#[doc(hidden)]
pub mod _preludet {
	//! Convenience re-exports and fixtures shared by unit and integration tests.

	pub use crate::_prelude::*;

	// std
	use std::sync::atomic::{AtomicUsize, Ordering};
	// self
	use crate::{
		auth::TokenSecret,
		client::ApiClient,
		descriptor::ApiDescriptor,
		http::ReqwestTransport,
		refresh::{RefreshFuture, RefreshOutcome, Refresher},
		token::TokenStore,
	};

	/// Client type alias used by reqwest-backed integration tests.
	pub type ReqwestTestClient = ApiClient<ReqwestTransport>;

	/// Refresher that replays a fixed outcome and counts how often it ran.
	#[derive(Debug)]
	pub struct ScriptedRefresher {
		calls: AtomicUsize,
		outcome: Mutex<RefreshOutcome>,
	}
	impl ScriptedRefresher {
		/// Always hands out `token`.
		pub fn issuing(token: &str) -> Self {
			Self::with_outcome(Ok(Some(TokenSecret::new(token))))
		}

		/// Always settles with `outcome`.
		pub fn with_outcome(outcome: RefreshOutcome) -> Self {
			Self { calls: AtomicUsize::new(0), outcome: Mutex::new(outcome) }
		}

		/// Number of refresh procedure invocations so far.
		pub fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}
	}
	impl Refresher for ScriptedRefresher {
		fn refresh(&self) -> RefreshFuture<'_> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			let outcome = self.outcome.lock().clone();

			Box::pin(async move { outcome })
		}
	}

	/// Builds a client for a local mock server, seeding the token store with `token` when given.
	pub fn build_test_client(
		base_url: &str,
		refresher: Arc<dyn Refresher>,
		token: Option<&str>,
	) -> (ReqwestTestClient, Arc<TokenStore>) {
		let descriptor = ApiDescriptor::builder(
			Url::parse(base_url).expect("Mock server base URL should parse successfully."),
		)
		.build()
		.expect("Loopback descriptor should build successfully.");
		let tokens = Arc::new(TokenStore::new(refresher));

		if let Some(value) = token {
			tokens.set_token(TokenSecret::new(value));
		}

		let client = ApiClient::with_transport(descriptor, tokens.clone(), ReqwestTransport::default());

		(client, tokens)
	}
}

mod _prelude {
	pub use std::{
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		sync::Arc,
	};

	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize, de::DeserializeOwned};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use tokio_util::sync::CancellationToken;
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use tokio_util::sync::CancellationToken;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
