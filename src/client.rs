//! Retry orchestrator: authenticated requests with one coordinated refresh-and-replay.
//!
//! Every request goes out with the token currently held by the [`TokenStore`]. A 401 moves the
//! request into recovery: when the store already holds a newer token (another request finished a
//! refresh in the meantime) the request replays with it; otherwise it joins the
//! [`RefreshGate`], which runs at most one refresh for all callers. The replay is sent exactly
//! once and its outcome is final. Any failure to obtain a usable token clears the store and
//! surfaces as [`Error::SessionExpired`].

// self
#[cfg(feature = "reqwest")] use crate::http::ReqwestTransport;
use crate::{
	_prelude::*,
	auth::{Credentials, TokenClaims, TokenSecret},
	descriptor::ApiDescriptor,
	error::{ConfigError, ExpiryReason},
	http::{self, ApiRequest, ApiResponse, HttpTransport, MultipartForm, StatusCode},
	obs::{self, CallKind, CallOutcome, CallSpan},
	refresh::{RefreshError, RefreshGate, RefreshOutcome},
	store::CredentialStore,
	token::TokenStore,
};

/// Client specialized for the crate's default reqwest transport.
#[cfg(feature = "reqwest")]
pub type ReqwestApiClient = ApiClient<ReqwestTransport>;

/// Coordinates authenticated calls against a single backend.
///
/// The client owns the transport, descriptor, token store, and refresh gate references. Clients
/// that talk to the same backend must share one [`TokenStore`] and one [`RefreshGate`] so their
/// refreshes coalesce; [`ApiClient::with_gate`] injects a shared gate.
pub struct ApiClient<T>
where
	T: ?Sized + HttpTransport,
{
	/// Transport used for every outbound request.
	pub transport: Arc<T>,
	/// Backend description (base URL, refresh settings).
	pub descriptor: ApiDescriptor,
	/// Observable access token state.
	pub tokens: Arc<TokenStore>,
	/// Single-flight gate serializing refreshes.
	pub gate: Arc<RefreshGate>,
	/// Optional persistence for the long-lived session credentials.
	pub credentials: Option<Arc<dyn CredentialStore>>,
}
impl<T> ApiClient<T>
where
	T: ?Sized + HttpTransport,
{
	/// Attempts granted to a caller whose refresh leader was dropped before settling.
	const ABANDONED_REFRESH_RETRIES: usize = 3;

	/// Creates a client that reuses the caller-provided transport.
	pub fn with_transport(
		descriptor: ApiDescriptor,
		tokens: Arc<TokenStore>,
		transport: impl Into<Arc<T>>,
	) -> Self {
		Self {
			transport: transport.into(),
			descriptor,
			tokens,
			gate: Default::default(),
			credentials: None,
		}
	}

	/// Replaces the refresh gate with one shared by other clients.
	pub fn with_gate(mut self, gate: Arc<RefreshGate>) -> Self {
		self.gate = gate;

		self
	}

	/// Attaches a credential store used by [`ApiClient::sign_in`] and friends.
	pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
		self.credentials = Some(store);

		self
	}

	/// Resolves `path` against the descriptor's base URL.
	pub fn url(&self, path: &str) -> Result<Url> {
		Ok(self.descriptor.endpoint(path).map_err(ConfigError::from)?)
	}

	/// Persists `credentials` and publishes their access token.
	pub async fn sign_in(&self, credentials: Credentials) -> Result<()> {
		let token = credentials.access_token.clone();

		if let Some(store) = &self.credentials {
			store.save(credentials).await?;
		}

		self.tokens.set_token(token);

		Ok(())
	}

	/// Publishes the access token of a previously persisted session.
	///
	/// Returns `false` when no session is stored.
	pub async fn restore_session(&self) -> Result<bool> {
		let Some(store) = &self.credentials else {
			return Ok(false);
		};

		match store.load().await? {
			Some(credentials) => {
				self.tokens.set_token(credentials.access_token);

				Ok(true)
			},
			None => Ok(false),
		}
	}

	/// Drops the access token and the persisted session.
	pub async fn sign_out(&self) -> Result<()> {
		self.tokens.clear();

		if let Some(store) = &self.credentials {
			store.clear().await?;
		}

		Ok(())
	}

	/// Sends `request`, recovering from a single 401 through the refresh gate.
	///
	/// Returns the response for 2xx statuses; every other status surfaces as an error.
	pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
		self.run(request, None).await
	}

	/// Same as [`ApiClient::send`], aborting with [`Error::Cancelled`] once `cancel` fires.
	///
	/// Cancelling never aborts a refresh other requests are waiting on; a caller queued behind
	/// the refresh just stops waiting for it. A caller that is itself running the refresh lets it
	/// finish, so the outcome still reaches the token store and the queued callers, and returns
	/// [`Error::Cancelled`] instead of replaying.
	pub async fn send_with_cancel(
		&self,
		request: ApiRequest,
		cancel: &CancellationToken,
	) -> Result<ApiResponse> {
		self.run(request, Some(cancel)).await
	}

	/// Fetches `path` and decodes the JSON response.
	pub async fn get_json<R>(&self, path: &str) -> Result<R>
	where
		R: DeserializeOwned,
	{
		self.send(ApiRequest::get(self.url(path)?)).await?.json()
	}

	/// Posts `body` as JSON to `path` and decodes the JSON response.
	pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
	where
		B: ?Sized + Serialize,
		R: DeserializeOwned,
	{
		self.send(ApiRequest::post(self.url(path)?).json(body)?).await?.json()
	}

	/// Uploads `form` as `multipart/form-data` to `path` and decodes the JSON response.
	pub async fn upload<R>(&self, path: &str, form: MultipartForm) -> Result<R>
	where
		R: DeserializeOwned,
	{
		self.send(ApiRequest::post(self.url(path)?).multipart(form)).await?.json()
	}

	async fn run(&self, request: ApiRequest, cancel: Option<&CancellationToken>) -> Result<ApiResponse> {
		const KIND: CallKind = CallKind::Request;

		let span = CallSpan::new(KIND, "send");

		obs::record_call_outcome(KIND, CallOutcome::Attempt);

		let result = span.instrument(self.orchestrate(&request, cancel, &span)).await;

		obs::record_call_outcome(KIND, CallOutcome::of(&result));

		result
	}

	async fn orchestrate(
		&self,
		request: &ApiRequest,
		cancel: Option<&CancellationToken>,
		span: &CallSpan,
	) -> Result<ApiResponse> {
		let epoch = self.tokens.epoch();
		let mut token = self.tokens.get_token();

		if self.expires_soon(token.as_ref()) {
			token = self.refresh_ahead(token, epoch, cancel).await?;
		}

		span.record_token(token.as_ref().map(TokenSecret::fingerprint).as_deref());

		let response = http::execute(self.transport.as_ref(), request, token.as_ref(), cancel).await?;

		if response.status != StatusCode::UNAUTHORIZED {
			return into_result(response);
		}

		let fresh = self.recover(token.as_ref(), epoch, cancel).await?;

		self.replay(request, &fresh, cancel).await
	}

	/// Renews a token that is about to expire before the server asks for it.
	///
	/// Only a rejected refresh credential ends the session here. Any other failure keeps `token`,
	/// which the server may still accept; a 401 on the request decides the rest.
	async fn refresh_ahead(
		&self,
		token: Option<TokenSecret>,
		epoch: u64,
		cancel: Option<&CancellationToken>,
	) -> Result<Option<TokenSecret>> {
		match self.await_refresh(token.as_ref(), epoch, cancel).await? {
			Ok(Some(fresh)) => Ok(Some(fresh)),
			Err(e @ RefreshError::Rejected { .. }) =>
				Err(self.expire(ExpiryReason::RefreshFailed(e))),
			Ok(None) | Err(_) => Ok(token),
		}
	}

	/// Produces a token newer than `stale`, expiring the session when none can be obtained.
	///
	/// A request sent without any token may still trigger a refresh, which restores a session
	/// whose access token was never loaded.
	async fn recover(
		&self,
		stale: Option<&TokenSecret>,
		epoch: u64,
		cancel: Option<&CancellationToken>,
	) -> Result<TokenSecret> {
		match self.await_refresh(stale, epoch, cancel).await? {
			Ok(Some(token)) => Ok(token),
			Ok(None) => Err(self.expire(ExpiryReason::NoToken)),
			Err(e) => Err(self.expire(ExpiryReason::RefreshFailed(e))),
		}
	}

	/// Settles on the outcome of the refresh that supersedes `stale`.
	///
	/// A token stored since `stale` was read is reused without refreshing. A store cleared since
	/// `epoch` ends the request without starting another refresh. A waiter whose leader was
	/// dropped retries the gate unless its own `cancel` fired.
	async fn await_refresh(
		&self,
		stale: Option<&TokenSecret>,
		epoch: u64,
		cancel: Option<&CancellationToken>,
	) -> Result<RefreshOutcome> {
		for _ in 0..Self::ABANDONED_REFRESH_RETRIES {
			match self.tokens.get_token() {
				Some(current) if Some(&current) != stale => return Ok(Ok(Some(current))),
				// Another request ended the session after this one was sent.
				None if stale.is_some() || self.tokens.epoch() != epoch =>
					return Err(Error::SessionExpired { reason: ExpiryReason::Cleared }),
				_ => {},
			}

			match self.gate.acquire(|| self.tokens.refresh(), cancel).await {
				Err(RefreshError::Abandoned) =>
					if cancel.is_some_and(CancellationToken::is_cancelled) {
						return Err(Error::Cancelled);
					},
				outcome => return Ok(outcome),
			}
		}

		Ok(Err(RefreshError::Abandoned))
	}

	async fn replay(
		&self,
		request: &ApiRequest,
		token: &TokenSecret,
		cancel: Option<&CancellationToken>,
	) -> Result<ApiResponse> {
		const KIND: CallKind = CallKind::Replay;

		let span = CallSpan::new(KIND, "replay");

		span.record_token(Some(&token.fingerprint()));
		obs::record_call_outcome(KIND, CallOutcome::Attempt);

		let result = span
			.instrument(async {
				let response =
					http::execute(self.transport.as_ref(), request, Some(token), cancel).await?;

				if response.status == StatusCode::UNAUTHORIZED {
					return Err(self.expire(ExpiryReason::ReplayRejected));
				}

				into_result(response)
			})
			.await;

		obs::record_call_outcome(KIND, CallOutcome::of(&result));

		result
	}

	fn expires_soon(&self, token: Option<&TokenSecret>) -> bool {
		let (Some(window), Some(token)) = (self.descriptor.preemptive_refresh, token) else {
			return false;
		};

		TokenClaims::peek(token)
			.is_ok_and(|claims| claims.expires_within(OffsetDateTime::now_utc(), window))
	}

	fn expire(&self, reason: ExpiryReason) -> Error {
		self.tokens.clear();

		Error::SessionExpired { reason }
	}
}
#[cfg(feature = "reqwest")]
impl ApiClient<ReqwestTransport> {
	/// Creates a client with its own reqwest transport, honoring the descriptor's request
	/// timeout.
	pub fn new(descriptor: ApiDescriptor, tokens: Arc<TokenStore>) -> Result<Self> {
		let transport = match descriptor.request_timeout {
			Some(timeout) => ReqwestTransport::with_timeout(timeout)?,
			None => ReqwestTransport::default(),
		};

		Ok(Self::with_transport(descriptor, tokens, transport))
	}
}
impl<T> Clone for ApiClient<T>
where
	T: ?Sized + HttpTransport,
{
	fn clone(&self) -> Self {
		Self {
			transport: self.transport.clone(),
			descriptor: self.descriptor.clone(),
			tokens: self.tokens.clone(),
			gate: self.gate.clone(),
			credentials: self.credentials.clone(),
		}
	}
}
impl<T> Debug for ApiClient<T>
where
	T: ?Sized + HttpTransport,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ApiClient")
			.field("descriptor", &self.descriptor)
			.field("tokens", &self.tokens)
			.field("refreshing", &self.gate.is_refreshing())
			.field("credential_store_set", &self.credentials.is_some())
			.finish()
	}
}

fn into_result(response: ApiResponse) -> Result<ApiResponse> {
	if response.is_success() {
		Ok(response)
	} else {
		Err(Error::Application { status: response.status.as_u16(), message: response.error_message() })
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::{
		collections::VecDeque,
		future,
		sync::atomic::{AtomicUsize, Ordering},
		time::Duration as StdDuration,
	};
	// self
	use super::*;
	use crate::{
		_preludet::ScriptedRefresher,
		error::TransportError,
		http::{HeaderMap, TransportFuture, header},
		refresh::{RefreshFuture, Refresher},
		store::MemoryStore,
	};

	/// Answers 401 to any token other than `accepted` and records the tokens it saw.
	struct TokenCheckingTransport {
		accepted: &'static str,
		seen: Mutex<Vec<Option<String>>>,
	}
	impl TokenCheckingTransport {
		fn new(accepted: &'static str) -> Self {
			Self { accepted, seen: Mutex::new(Vec::new()) }
		}
	}
	impl HttpTransport for TokenCheckingTransport {
		fn send(&self, request: ApiRequest) -> TransportFuture<'_> {
			let bearer = request
				.headers
				.get(header::AUTHORIZATION)
				.and_then(|value| value.to_str().ok())
				.and_then(|value| value.strip_prefix("Bearer "))
				.map(ToOwned::to_owned);
			let status = if bearer.as_deref() == Some(self.accepted) {
				StatusCode::OK
			} else {
				StatusCode::UNAUTHORIZED
			};

			self.seen.lock().push(bearer);

			Box::pin(async move {
				Ok(ApiResponse { status, headers: HeaderMap::new(), body: b"{}".to_vec() })
			})
		}
	}

	/// Replays canned statuses in order.
	struct ScriptedTransport {
		statuses: Mutex<VecDeque<StatusCode>>,
		calls: AtomicUsize,
	}
	impl HttpTransport for ScriptedTransport {
		fn send(&self, _: ApiRequest) -> TransportFuture<'_> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			let next = self.statuses.lock().pop_front();

			Box::pin(async move {
				match next {
					Some(status) =>
						Ok(ApiResponse { status, headers: HeaderMap::new(), body: Vec::new() }),
					None => Err(TransportError::Io(std::io::Error::other("script exhausted"))),
				}
			})
		}
	}

	/// Never settles its first refresh; later refreshes issue `token-b`.
	#[derive(Default)]
	struct StallingRefresher {
		calls: AtomicUsize,
	}
	impl Refresher for StallingRefresher {
		fn refresh(&self) -> RefreshFuture<'_> {
			let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;

			Box::pin(async move {
				if first {
					future::pending::<()>().await;
				}

				Ok(Some(TokenSecret::new("token-b")))
			})
		}
	}

	fn descriptor() -> ApiDescriptor {
		ApiDescriptor::builder(
			Url::parse("https://api.example.com").expect("Base URL should parse successfully."),
		)
		.build()
		.expect("Descriptor should build successfully.")
	}

	fn client<T>(
		transport: T,
		refresher: Arc<ScriptedRefresher>,
		token: Option<&str>,
	) -> ApiClient<T>
	where
		T: HttpTransport,
	{
		let tokens = Arc::new(TokenStore::new(refresher));

		if let Some(token) = token {
			tokens.set_token(TokenSecret::new(token));
		}

		ApiClient::with_transport(descriptor(), tokens, transport)
	}

	fn request<T>(client: &ApiClient<T>) -> ApiRequest
	where
		T: HttpTransport,
	{
		ApiRequest::get(client.url("/v1/profile").expect("Path should resolve."))
	}

	#[tokio::test]
	async fn unauthorized_request_is_replayed_with_refreshed_token() {
		let refresher = Arc::new(ScriptedRefresher::issuing("token-b"));
		let client = client(TokenCheckingTransport::new("token-b"), refresher.clone(), Some("token-a"));
		let response = client.send(request(&client)).await.expect("Replay should succeed.");

		assert_eq!(response.status, StatusCode::OK);
		assert_eq!(refresher.calls(), 1);
		assert_eq!(client.tokens.get_token(), Some(TokenSecret::new("token-b")));
		assert_eq!(
			*client.transport.seen.lock(),
			vec![Some("token-a".to_owned()), Some("token-b".to_owned())]
		);
	}

	#[tokio::test]
	async fn newer_stored_token_skips_the_gate() {
		let refresher = Arc::new(ScriptedRefresher::issuing("unused"));
		let client = client(TokenCheckingTransport::new("token-b"), refresher.clone(), Some("token-b"));
		let recovered = client
			.recover(Some(&TokenSecret::new("token-a")), client.tokens.epoch(), None)
			.await
			.expect("Stored token should be reused.");

		assert_eq!(recovered, TokenSecret::new("token-b"));
		assert_eq!(refresher.calls(), 0);
		assert_eq!(client.gate.metrics().attempts(), 0);
	}

	#[tokio::test]
	async fn cleared_session_is_not_refreshed_again() {
		let refresher = Arc::new(ScriptedRefresher::issuing("unused"));
		let client = client(TokenCheckingTransport::new("token-b"), refresher.clone(), None);
		let err = client
			.recover(Some(&TokenSecret::new("token-a")), client.tokens.epoch(), None)
			.await
			.expect_err("Cleared session should not be recovered.");

		assert!(matches!(err, Error::SessionExpired { reason: ExpiryReason::Cleared }));
		assert_eq!(refresher.calls(), 0);
	}

	#[tokio::test]
	async fn failed_refresh_is_not_repeated_for_tokenless_requests() {
		let refresher = Arc::new(ScriptedRefresher::with_outcome(Err(RefreshError::Unavailable {
			status: 503,
		})));
		let client = client(TokenCheckingTransport::new("token-b"), refresher.clone(), None);
		let sent_at = client.tokens.epoch();
		let err = client.send(request(&client)).await.expect_err("Failed refresh should expire.");

		assert!(matches!(
			err,
			Error::SessionExpired { reason: ExpiryReason::RefreshFailed(RefreshError::Unavailable { .. }) }
		));

		// A tokenless request sent before that refresh settled sees the cleared session.
		let err = client
			.recover(None, sent_at, None)
			.await
			.expect_err("Cleared session should not be refreshed again.");

		assert!(matches!(err, Error::SessionExpired { reason: ExpiryReason::Cleared }));
		assert_eq!(refresher.calls(), 1);
	}

	#[tokio::test]
	async fn waiter_refreshes_again_after_its_leader_is_dropped() {
		let refresher = Arc::new(StallingRefresher::default());
		let tokens = Arc::new(TokenStore::new(refresher.clone()));

		tokens.set_token(TokenSecret::new("token-a"));

		let client: ApiClient<TokenCheckingTransport> =
			ApiClient::with_transport(descriptor(), tokens, TokenCheckingTransport::new("token-b"));
		let leader = tokio::time::timeout(StdDuration::from_millis(50), client.send(request(&client)));
		let waiter = client.send(request(&client));
		let (leader, waiter) = tokio::join!(leader, waiter);

		assert!(leader.is_err(), "Leader should have been dropped by the timeout.");

		let response = waiter.expect("Waiter should recover through its own refresh.");

		assert_eq!(response.status, StatusCode::OK);
		assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
		assert_eq!(client.gate.metrics().coalesced(), 1);
		assert_eq!(client.tokens.get_token(), Some(TokenSecret::new("token-b")));
	}

	#[tokio::test]
	async fn missing_token_is_recovered_through_the_gate() {
		let refresher = Arc::new(ScriptedRefresher::issuing("token-b"));
		let client = client(TokenCheckingTransport::new("token-b"), refresher.clone(), None);
		let response = client.send(request(&client)).await.expect("Refresh should restore the session.");

		assert_eq!(response.status, StatusCode::OK);
		assert_eq!(refresher.calls(), 1);
		assert_eq!(*client.transport.seen.lock(), vec![None, Some("token-b".to_owned())]);
	}

	#[tokio::test]
	async fn second_unauthorized_expires_the_session() {
		let refresher = Arc::new(ScriptedRefresher::issuing("token-b"));
		let transport = ScriptedTransport {
			statuses: Mutex::new(VecDeque::from([StatusCode::UNAUTHORIZED, StatusCode::UNAUTHORIZED])),
			calls: AtomicUsize::new(0),
		};
		let client = client(transport, refresher.clone(), Some("token-a"));
		let err = client.send(request(&client)).await.expect_err("Second 401 should fail.");

		assert!(matches!(err, Error::SessionExpired { reason: ExpiryReason::ReplayRejected }));
		assert_eq!(client.transport.calls.load(Ordering::SeqCst), 2);
		assert_eq!(refresher.calls(), 1);
		assert_eq!(client.tokens.get_token(), None);
	}

	#[tokio::test]
	async fn refresh_without_token_expires_the_session() {
		let refresher = Arc::new(ScriptedRefresher::with_outcome(Ok(None)));
		let client = client(TokenCheckingTransport::new("token-b"), refresher, Some("token-a"));
		let err = client.send(request(&client)).await.expect_err("Empty refresh should fail.");

		assert!(matches!(err, Error::SessionExpired { reason: ExpiryReason::NoToken }));
		assert_eq!(client.tokens.get_token(), None);
	}

	#[tokio::test]
	async fn application_errors_are_not_retried() {
		let refresher = Arc::new(ScriptedRefresher::issuing("unused"));
		let transport = ScriptedTransport {
			statuses: Mutex::new(VecDeque::from([StatusCode::FORBIDDEN])),
			calls: AtomicUsize::new(0),
		};
		let client = client(transport, refresher.clone(), Some("token-a"));
		let err = client.send(request(&client)).await.expect_err("403 should fail.");

		assert_eq!(err.status(), Some(403));
		assert_eq!(refresher.calls(), 0);
		assert_eq!(client.tokens.get_token(), Some(TokenSecret::new("token-a")));
	}

	#[tokio::test]
	async fn sign_in_and_sign_out_drive_both_stores() {
		let refresher = Arc::new(ScriptedRefresher::issuing("unused"));
		let store = Arc::new(MemoryStore::default());
		let client = client(TokenCheckingTransport::new("token-a"), refresher, None)
			.with_credential_store(store.clone());

		client
			.sign_in(Credentials::new("token-a").with_refresh_token("refresh-a"))
			.await
			.expect("Sign-in should succeed.");

		assert_eq!(client.tokens.get_token(), Some(TokenSecret::new("token-a")));
		assert!(store.load().await.expect("Store should load.").is_some());

		client.tokens.clear();

		assert!(client.restore_session().await.expect("Restore should succeed."));
		assert_eq!(client.tokens.get_token(), Some(TokenSecret::new("token-a")));

		client.sign_out().await.expect("Sign-out should succeed.");

		assert_eq!(client.tokens.get_token(), None);
		assert!(store.load().await.expect("Store should load.").is_none());
		assert!(!client.restore_session().await.expect("Restore should succeed."));
	}
}
