//! JSON refresh-endpoint exchange with compare-and-swap credential rotation.
//!
//! [`EndpointRefresher`] POSTs the stored refresh token to the descriptor's refresh endpoint,
//! reads the new access token from the response, and rotates the stored credentials with
//! [`CredentialStore::compare_and_swap_refresh`]. A rotation that loses the race to another
//! process adopts the winner's credentials instead of overwriting them.

// self
use crate::{
	_prelude::*,
	descriptor::ApiDescriptor,
	error::ConfigError,
	http::{self, ApiRequest, HttpTransport, RequestBody},
	refresh::{self, RefreshError, RefreshFuture, RefreshOutcome, Refresher},
	store::CredentialStore,
};

#[derive(Deserialize)]
struct RefreshResponse {
	#[serde(alias = "accessToken")]
	access_token: String,
	#[serde(default, alias = "refreshToken")]
	refresh_token: Option<String>,
	#[serde(default, alias = "expiresIn")]
	expires_in: Option<i64>,
}

/// [`Refresher`] that exchanges the stored refresh token at a JSON endpoint.
pub struct EndpointRefresher<T>
where
	T: ?Sized + HttpTransport,
{
	transport: Arc<T>,
	endpoint: Url,
	field: String,
	store: Arc<dyn CredentialStore>,
}
impl<T> EndpointRefresher<T>
where
	T: ?Sized + HttpTransport,
{
	/// Creates a refresher for the descriptor's refresh endpoint.
	pub fn new(
		descriptor: &ApiDescriptor,
		transport: impl Into<Arc<T>>,
		store: Arc<dyn CredentialStore>,
	) -> Result<Self, ConfigError> {
		let endpoint =
			descriptor.refresh_endpoint.clone().ok_or(ConfigError::MissingRefreshEndpoint)?;

		Ok(Self {
			transport: transport.into(),
			endpoint,
			field: descriptor.refresh_token_field.clone(),
			store,
		})
	}

	/// Endpoint the refresh token is posted to.
	pub fn endpoint(&self) -> &Url {
		&self.endpoint
	}

	async fn exchange(&self) -> RefreshOutcome {
		let current = self.store.load().await?.ok_or(RefreshError::MissingRefreshToken)?;
		let expected = current.refresh_secret().ok_or(RefreshError::MissingRefreshToken)?;
		let mut payload = serde_json::Map::new();

		payload.insert(self.field.clone(), serde_json::Value::String(expected.to_owned()));

		let request = ApiRequest {
			body: RequestBody::Json(serde_json::Value::Object(payload).to_string().into_bytes()),
			..ApiRequest::post(self.endpoint.clone())
		};
		let response = http::execute(self.transport.as_ref(), &request, None, None)
			.await
			.map_err(|e| RefreshError::Network { message: refresh::describe_chain(&e) })?;

		match response.status.as_u16() {
			200..=299 => {},
			status @ (400 | 401 | 403) => {
				self.store.clear().await?;

				let reason = response
					.error_message()
					.or_else(|| response.status.canonical_reason().map(ToOwned::to_owned))
					.unwrap_or_else(|| "rejected".into());

				return Err(RefreshError::Rejected { status: Some(status), reason });
			},
			status => return Err(RefreshError::Unavailable { status }),
		}

		let payload: RefreshResponse =
			serde_path_to_error::deserialize(&mut serde_json::Deserializer::from_slice(&response.body))
				.map_err(|e| RefreshError::Malformed { message: e.to_string() })?;

		if payload.access_token.trim().is_empty() {
			return Ok(None);
		}

		let rotated = current.rotate(
			payload.access_token,
			payload.refresh_token,
			payload.expires_in.map(Duration::seconds),
		);

		refresh::persist_rotation(self.store.as_ref(), expected, rotated).await
	}
}
impl<T> Refresher for EndpointRefresher<T>
where
	T: ?Sized + HttpTransport,
{
	fn refresh(&self) -> RefreshFuture<'_> {
		Box::pin(self.exchange())
	}
}
impl<T> Debug for EndpointRefresher<T>
where
	T: ?Sized + HttpTransport,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("EndpointRefresher")
			.field("endpoint", &self.endpoint.as_str())
			.field("field", &self.field)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::collections::VecDeque;
	// self
	use super::*;
	use crate::{
		auth::{Credentials, TokenSecret},
		error::TransportError,
		http::{ApiResponse, HeaderMap, StatusCode, TransportFuture},
		store::MemoryStore,
	};

	/// Lets another session win the rotation race while the exchange is in flight.
	struct RacingTransport {
		store: Arc<MemoryStore>,
	}
	impl HttpTransport for RacingTransport {
		fn send(&self, _: ApiRequest) -> TransportFuture<'_> {
			Box::pin(async move {
				self.store
					.save(Credentials::new("token-c").with_refresh_token("refresh-c"))
					.await
					.map_err(TransportError::network)?;

				Ok(ApiResponse {
					status: StatusCode::OK,
					headers: HeaderMap::new(),
					body: br#"{"access_token":"token-b"}"#.to_vec(),
				})
			})
		}
	}

	/// Replays canned responses and captures request bodies.
	#[derive(Default)]
	struct CannedTransport {
		responses: Mutex<VecDeque<(StatusCode, &'static str)>>,
		bodies: Mutex<Vec<serde_json::Value>>,
	}
	impl CannedTransport {
		fn answering(status: StatusCode, body: &'static str) -> Self {
			let transport = Self::default();

			transport.responses.lock().push_back((status, body));

			transport
		}
	}
	impl HttpTransport for CannedTransport {
		fn send(&self, request: ApiRequest) -> TransportFuture<'_> {
			if let RequestBody::Json(bytes) = &request.body {
				if let Ok(value) = serde_json::from_slice(bytes) {
					self.bodies.lock().push(value);
				}
			}

			let next = self.responses.lock().pop_front();

			Box::pin(async move {
				let (status, body) = next.ok_or_else(|| {
					TransportError::Io(std::io::Error::new(
						std::io::ErrorKind::ConnectionRefused,
						"refused",
					))
				})?;

				Ok(ApiResponse { status, headers: HeaderMap::new(), body: body.as_bytes().to_vec() })
			})
		}
	}

	fn descriptor() -> ApiDescriptor {
		ApiDescriptor::builder(
			Url::parse("https://api.example.com").expect("Base URL should parse successfully."),
		)
		.refresh_path("auth/refresh")
		.refresh_token_field("refreshToken")
		.build()
		.expect("Descriptor should build successfully.")
	}

	fn refresher(
		transport: CannedTransport,
		store: Arc<MemoryStore>,
	) -> EndpointRefresher<CannedTransport> {
		EndpointRefresher::new(&descriptor(), transport, store)
			.expect("Refresher should build successfully.")
	}

	fn signed_in() -> Arc<MemoryStore> {
		Arc::new(MemoryStore::with_credentials(
			Credentials::new("token-a").with_refresh_token("refresh-a"),
		))
	}

	#[test]
	fn descriptor_without_refresh_endpoint_is_rejected() {
		let descriptor = ApiDescriptor::builder(
			Url::parse("https://api.example.com").expect("Base URL should parse successfully."),
		)
		.build()
		.expect("Descriptor should build successfully.");
		let err = EndpointRefresher::<CannedTransport>::new(
			&descriptor,
			CannedTransport::default(),
			signed_in(),
		)
		.expect_err("Missing endpoint should be rejected.");

		assert!(matches!(err, ConfigError::MissingRefreshEndpoint));
	}

	#[tokio::test]
	async fn rotates_credentials_on_success() {
		let store = signed_in();
		let refresher = refresher(
			CannedTransport::answering(
				StatusCode::OK,
				r#"{"accessToken":"token-b","refreshToken":"refresh-b","expiresIn":900}"#,
			),
			store.clone(),
		);
		let outcome = refresher.refresh().await;

		assert_eq!(outcome, Ok(Some(TokenSecret::new("token-b"))));
		assert_eq!(
			*refresher.transport.bodies.lock(),
			vec![serde_json::json!({ "refreshToken": "refresh-a" })]
		);

		let stored = store.load().await.expect("Store should load.").expect("Session should exist.");

		assert_eq!(stored.access_token.expose(), "token-b");
		assert_eq!(stored.refresh_secret(), Some("refresh-b"));
		assert!(stored.expires_at.is_some());
	}

	#[tokio::test]
	async fn rejection_clears_the_session() {
		let store = signed_in();
		let refresher = refresher(
			CannedTransport::answering(
				StatusCode::UNAUTHORIZED,
				r#"{"message":"Refresh token revoked"}"#,
			),
			store.clone(),
		);

		assert_eq!(
			refresher.refresh().await,
			Err(RefreshError::Rejected { status: Some(401), reason: "Refresh token revoked".into() })
		);
		assert!(store.load().await.expect("Store should load.").is_none());
	}

	#[tokio::test]
	async fn server_errors_keep_the_session() {
		let store = signed_in();
		let refresher =
			refresher(CannedTransport::answering(StatusCode::BAD_GATEWAY, ""), store.clone());

		assert_eq!(refresher.refresh().await, Err(RefreshError::Unavailable { status: 502 }));
		assert!(store.load().await.expect("Store should load.").is_some());
	}

	#[tokio::test]
	async fn malformed_payload_names_the_field() {
		let refresher = refresher(
			CannedTransport::answering(StatusCode::OK, r#"{"access_token":42}"#),
			signed_in(),
		);

		match refresher.refresh().await {
			Err(RefreshError::Malformed { message }) =>
				assert!(message.starts_with("access_token")),
			other => panic!("Expected a malformed payload error, got {other:?}."),
		}
	}

	#[tokio::test]
	async fn missing_refresh_token_skips_the_network() {
		let store = Arc::new(MemoryStore::with_credentials(Credentials::new("token-a")));
		let refresher = refresher(CannedTransport::default(), store);

		assert_eq!(refresher.refresh().await, Err(RefreshError::MissingRefreshToken));
		assert!(refresher.transport.bodies.lock().is_empty());
	}

	#[tokio::test]
	async fn unreachable_endpoint_is_a_network_failure() {
		let refresher = refresher(CannedTransport::default(), signed_in());

		match refresher.refresh().await {
			Err(RefreshError::Network { message }) => assert!(message.contains("refused")),
			other => panic!("Expected a network error, got {other:?}."),
		}
	}

	#[tokio::test]
	async fn lost_rotation_race_adopts_the_winner() {
		let store = signed_in();
		let refresher = EndpointRefresher::<RacingTransport>::new(
			&descriptor(),
			RacingTransport { store: store.clone() },
			store.clone(),
		)
		.expect("Refresher should build successfully.");

		assert_eq!(refresher.refresh().await, Ok(Some(TokenSecret::new("token-c"))));

		let stored = store.load().await.expect("Store should load.").expect("Session should exist.");

		assert_eq!(stored.refresh_secret(), Some("refresh-c"));
	}
}
