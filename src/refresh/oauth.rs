//! Standard OAuth 2.0 `refresh_token` grant backed by the `oauth2` crate.

// crates.io
use oauth2::{
	AsyncHttpClient, AuthType, ClientId, ClientSecret, EndpointNotSet, EndpointSet,
	HttpClientError, HttpRequest, HttpResponse, RefreshToken, RequestTokenError, Scope,
	TokenResponse, TokenUrl,
	basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicRequestTokenError},
};
use reqwest::redirect::Policy;
// self
use crate::{
	_prelude::*,
	error::ConfigError,
	refresh::{self, RefreshError, RefreshFuture, RefreshOutcome, Refresher},
	store::CredentialStore,
};

type ConfiguredBasicClient =
	BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Reqwest adapter implementing [`AsyncHttpClient`] for token endpoint calls.
///
/// Token endpoints answer directly, so the default client never follows redirects. Configure any
/// custom [`ReqwestClient`] passed to [`OAuthHttpClient::with_client`] the same way.
#[derive(Clone, Debug)]
pub struct OAuthHttpClient(ReqwestClient);
impl OAuthHttpClient {
	/// Builds a client that does not follow redirects.
	pub fn new() -> Result<Self, ConfigError> {
		let client = ReqwestClient::builder()
			.redirect(Policy::none())
			.build()
			.map_err(ConfigError::http_client_build)?;

		Ok(Self(client))
	}

	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}
}
impl<'c> AsyncHttpClient<'c> for OAuthHttpClient {
	type Error = HttpClientError<ReqwestError>;
	type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send>>;

	fn call(&'c self, request: HttpRequest) -> Self::Future {
		Box::pin(async move {
			let response =
				self.0.execute(request.try_into().map_err(Box::new)?).await.map_err(Box::new)?;
			let status = response.status();
			let headers = response.headers().to_owned();
			let mut converted =
				HttpResponse::new(response.bytes().await.map_err(Box::new)?.to_vec());

			*converted.status_mut() = status;
			*converted.headers_mut() = headers;

			Ok(converted)
		})
	}
}

/// [`Refresher`] performing the OAuth 2.0 `refresh_token` grant.
///
/// `invalid_grant` answers discard the stored session, since the refresh token will never work
/// again; other failures keep it.
pub struct OAuth2Refresher {
	client: ConfiguredBasicClient,
	http: OAuthHttpClient,
	store: Arc<dyn CredentialStore>,
	scopes: Vec<String>,
}
impl OAuth2Refresher {
	/// Creates a refresher for a public client at `token_endpoint`.
	pub fn new(
		token_endpoint: &Url,
		client_id: impl Into<String>,
		store: Arc<dyn CredentialStore>,
	) -> Result<Self, ConfigError> {
		let token_url = TokenUrl::new(token_endpoint.to_string())
			.map_err(|source| ConfigError::InvalidTokenEndpoint { source })?;
		let client = BasicClient::new(ClientId::new(client_id.into())).set_token_uri(token_url);

		Ok(Self { client, http: OAuthHttpClient::new()?, store, scopes: Vec::new() })
	}

	/// Authenticates as a confidential client (HTTP Basic by default).
	pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
		self.client = self.client.set_client_secret(ClientSecret::new(secret.into()));

		self
	}

	/// Sends client credentials in the form body instead of the `Authorization` header.
	pub fn with_auth_in_body(mut self) -> Self {
		self.client = self.client.set_auth_type(AuthType::RequestBody);

		self
	}

	/// Requests `scopes` with every refresh.
	pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.scopes = scopes.into_iter().map(Into::into).collect();

		self
	}

	/// Replaces the HTTP client used for token endpoint calls.
	pub fn with_http_client(mut self, http: OAuthHttpClient) -> Self {
		self.http = http;

		self
	}

	async fn exchange(&self) -> RefreshOutcome {
		let current = self.store.load().await?.ok_or(RefreshError::MissingRefreshToken)?;
		let expected = current.refresh_secret().ok_or(RefreshError::MissingRefreshToken)?;
		let refresh_token = RefreshToken::new(expected.to_owned());
		let mut request = self.client.exchange_refresh_token(&refresh_token);

		for scope in &self.scopes {
			request = request.add_scope(Scope::new(scope.clone()));
		}

		let response = match request.request_async(&self.http).await {
			Ok(response) => response,
			Err(RequestTokenError::ServerResponse(response)) => {
				if *response.error() == BasicErrorResponseType::InvalidGrant {
					self.store.clear().await?;
				}

				return Err(rejection(&response));
			},
			Err(e) => return Err(map_request_error(e)),
		};
		let rotated = current.rotate(
			response.access_token().secret().to_owned(),
			response.refresh_token().map(|token| token.secret().to_owned()),
			response.expires_in().and_then(|expires_in| Duration::try_from(expires_in).ok()),
		);

		refresh::persist_rotation(self.store.as_ref(), expected, rotated).await
	}
}
impl Refresher for OAuth2Refresher {
	fn refresh(&self) -> RefreshFuture<'_> {
		Box::pin(self.exchange())
	}
}
impl Debug for OAuth2Refresher {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("OAuth2Refresher")
			.field("client_id", self.client.client_id())
			.field("scopes", &self.scopes)
			.finish_non_exhaustive()
	}
}

fn rejection(response: &BasicErrorResponse) -> RefreshError {
	let reason = match response.error_description() {
		Some(description) => format!("{}: {description}", response.error().as_ref()),
		None => response.error().as_ref().to_owned(),
	};

	RefreshError::Rejected { status: None, reason }
}

fn map_request_error(err: BasicRequestTokenError<HttpClientError<ReqwestError>>) -> RefreshError {
	match err {
		RequestTokenError::ServerResponse(response) => rejection(&response),
		RequestTokenError::Request(error) =>
			RefreshError::Network { message: refresh::describe_chain(&error) },
		RequestTokenError::Parse(error, _body) =>
			RefreshError::Malformed { message: error.to_string() },
		RequestTokenError::Other(message) => RefreshError::Malformed { message },
	}
}
