//! Request executor: header construction, transport dispatch, and failure classification.
//!
//! The module exposes [`HttpTransport`] as the crate's only dependency on an HTTP stack.
//! [`execute`] attaches the bearer token, sends the request through the transport, and hands
//! back the raw [`ApiResponse`] without interpreting its status. Status handling (401 recovery,
//! application errors) belongs to [`ApiClient`](crate::client::ApiClient).

pub use oauth2::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};

// self
use crate::{
	_prelude::*,
	auth::TokenSecret,
	error::{ConfigError, TransportError},
};

/// Boxed future returned by [`HttpTransport::send`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<ApiResponse, TransportError>> + 'a + Send>>;

/// Abstraction over HTTP stacks capable of sending [`ApiRequest`]s.
///
/// Implementations must be `Send + Sync + 'static` so one transport can be shared by the client
/// and the refresh procedure behind an `Arc`. They report connectivity problems as
/// [`TransportError::Network`] and requests they cannot build as [`TransportError::Build`];
/// every HTTP status, 401 included, comes back as an [`ApiResponse`].
pub trait HttpTransport
where
	Self: 'static + Send + Sync,
{
	/// Sends `request` and buffers the full response body.
	fn send(&self, request: ApiRequest) -> TransportFuture<'_>;
}

/// Outbound request description, independent of the transport that sends it.
#[derive(Clone, Debug)]
pub struct ApiRequest {
	/// HTTP method.
	pub method: Method,
	/// Absolute request URL.
	pub url: Url,
	/// Caller-supplied headers; these win over the executor's defaults.
	pub headers: HeaderMap,
	/// Request payload.
	pub body: RequestBody,
}
impl ApiRequest {
	/// Creates a request with no headers and an empty body.
	pub fn new(method: Method, url: Url) -> Self {
		Self { method, url, headers: HeaderMap::new(), body: RequestBody::Empty }
	}

	/// Shorthand for a `GET` request.
	pub fn get(url: Url) -> Self {
		Self::new(Method::GET, url)
	}

	/// Shorthand for a `POST` request.
	pub fn post(url: Url) -> Self {
		Self::new(Method::POST, url)
	}

	/// Shorthand for a `PUT` request.
	pub fn put(url: Url) -> Self {
		Self::new(Method::PUT, url)
	}

	/// Shorthand for a `PATCH` request.
	pub fn patch(url: Url) -> Self {
		Self::new(Method::PATCH, url)
	}

	/// Shorthand for a `DELETE` request.
	pub fn delete(url: Url) -> Self {
		Self::new(Method::DELETE, url)
	}

	/// Sets a header, replacing any previous value under the same name.
	pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.headers.insert(name, value);

		self
	}

	/// Serializes `payload` as the JSON body.
	pub fn json<T>(mut self, payload: &T) -> Result<Self>
	where
		T: ?Sized + Serialize,
	{
		let bytes = serde_json::to_vec(payload).map_err(ConfigError::Serialize)?;

		self.body = RequestBody::Json(bytes);

		Ok(self)
	}

	/// Uses raw bytes as the body, optionally labeled with a content type.
	pub fn bytes(mut self, content: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
		self.body =
			RequestBody::Bytes { content: content.into(), content_type: content_type.map(Into::into) };

		self
	}

	/// Uses a multipart form as the body.
	pub fn multipart(mut self, form: MultipartForm) -> Self {
		self.body = RequestBody::Multipart(form);

		self
	}
}

/// Request payload variants.
#[derive(Clone, Debug, Default)]
pub enum RequestBody {
	/// No payload.
	#[default]
	Empty,
	/// Pre-serialized JSON.
	Json(Vec<u8>),
	/// Opaque binary payload.
	Bytes {
		/// Raw payload.
		content: Vec<u8>,
		/// Content type to announce, if any.
		content_type: Option<String>,
	},
	/// `multipart/form-data` payload; the transport picks the boundary.
	Multipart(MultipartForm),
}

/// Transport-neutral `multipart/form-data` description.
#[derive(Clone, Debug, Default)]
pub struct MultipartForm {
	parts: Vec<FormPart>,
}
impl MultipartForm {
	/// Creates an empty form.
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a text field.
	pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.parts.push(FormPart { name: name.into(), value: FormValue::Text(value.into()) });

		self
	}

	/// Appends a file field such as `image` or `audio`.
	pub fn file(
		mut self,
		name: impl Into<String>,
		bytes: impl Into<Vec<u8>>,
		file_name: impl Into<String>,
		mime: impl Into<String>,
	) -> Self {
		self.parts.push(FormPart {
			name: name.into(),
			value: FormValue::File {
				bytes: bytes.into(),
				file_name: file_name.into(),
				mime: mime.into(),
			},
		});

		self
	}

	/// Field names in insertion order.
	pub fn field_names(&self) -> impl Iterator<Item = &str> {
		self.parts.iter().map(|part| part.name.as_str())
	}

	/// Returns `true` when the form has no fields.
	pub fn is_empty(&self) -> bool {
		self.parts.is_empty()
	}

	#[cfg(feature = "reqwest")]
	fn into_reqwest(self) -> Result<reqwest::multipart::Form, ReqwestError> {
		// crates.io
		use reqwest::multipart::{Form, Part};

		let mut form = Form::new();

		for FormPart { name, value } in self.parts {
			form = match value {
				FormValue::Text(text) => form.text(name, text),
				FormValue::File { bytes, file_name, mime } =>
					form.part(name, Part::bytes(bytes).file_name(file_name).mime_str(&mime)?),
			};
		}

		Ok(form)
	}
}

#[derive(Clone)]
struct FormPart {
	name: String,
	value: FormValue,
}
impl Debug for FormPart {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let mut s = f.debug_struct("FormPart");

		s.field("name", &self.name);

		match &self.value {
			FormValue::Text(text) => s.field("text", text),
			FormValue::File { bytes, file_name, mime } => s
				.field("file_name", file_name)
				.field("mime", mime)
				.field("len", &bytes.len()),
		};

		s.finish()
	}
}

#[derive(Clone)]
enum FormValue {
	Text(String),
	File { bytes: Vec<u8>, file_name: String, mime: String },
}

/// Fully buffered HTTP response.
#[derive(Clone, Debug)]
pub struct ApiResponse {
	/// Response status.
	pub status: StatusCode,
	/// Response headers.
	pub headers: HeaderMap,
	/// Response body.
	pub body: Vec<u8>,
}
impl ApiResponse {
	/// Returns `true` for 2xx statuses.
	pub fn is_success(&self) -> bool {
		self.status.is_success()
	}

	/// Decodes the body as JSON, naming the offending field on failure.
	pub fn json<T>(&self) -> Result<T>
	where
		T: DeserializeOwned,
	{
		let mut deserializer = serde_json::Deserializer::from_slice(&self.body);

		serde_path_to_error::deserialize(&mut deserializer)
			.map_err(|source| Error::Decode { source, status: self.status.as_u16() })
	}

	/// Returns the body as text, replacing invalid UTF-8.
	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}

	/// Extracts a human-readable message from a JSON error body.
	///
	/// Looks at the `message`, `detail`, and `error` fields in that order.
	pub fn error_message(&self) -> Option<String> {
		let value = serde_json::from_slice::<serde_json::Value>(&self.body).ok()?;

		["message", "detail", "error"].into_iter().find_map(|field| {
			value
				.get(field)
				.and_then(serde_json::Value::as_str)
				.map(str::trim)
				.filter(|message| !message.is_empty())
				.map(ToOwned::to_owned)
		})
	}
}

/// Reqwest-backed [`HttpTransport`].
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport(pub ReqwestClient);
#[cfg(feature = "reqwest")]
impl ReqwestTransport {
	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}

	/// Builds a client whose requests time out after `timeout`.
	pub fn with_timeout(timeout: Duration) -> Result<Self, ConfigError> {
		let client = ReqwestClient::builder()
			.timeout(timeout.unsigned_abs())
			.build()
			.map_err(ConfigError::http_client_build)?;

		Ok(Self(client))
	}
}
#[cfg(feature = "reqwest")]
impl HttpTransport for ReqwestTransport {
	fn send(&self, request: ApiRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			let ApiRequest { method, url, headers, body } = request;
			let builder = self.0.request(method, url).headers(headers);
			let builder = match body {
				RequestBody::Empty => builder,
				RequestBody::Json(content) | RequestBody::Bytes { content, .. } =>
					builder.body(content),
				RequestBody::Multipart(form) => builder.multipart(form.into_reqwest()?),
			};
			let response = builder.send().await?;
			let status = response.status();
			let headers = response.headers().to_owned();
			let body = response.bytes().await?.to_vec();

			Ok(ApiResponse { status, headers, body })
		})
	}
}

/// Applies the executor's header rules to `request`.
///
/// - `Content-Type: application/json` for JSON and empty bodies.
/// - The declared content type for binary bodies; nothing for multipart bodies, whose boundary the
///   transport adds.
/// - Caller-supplied headers replace those defaults.
/// - `Authorization: Bearer <token>` when a token is present, marked sensitive.
pub fn prepare(request: ApiRequest, token: Option<&TokenSecret>) -> Result<ApiRequest> {
	let ApiRequest { method, url, headers: caller, body } = request;
	let mut headers = HeaderMap::new();

	match &body {
		RequestBody::Empty | RequestBody::Json(_) => {
			headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
		},
		RequestBody::Bytes { content_type: Some(content_type), .. } => {
			let value = HeaderValue::from_str(content_type)
				.map_err(|_| ConfigError::InvalidHeader { name: "Content-Type" })?;

			headers.insert(header::CONTENT_TYPE, value);
		},
		RequestBody::Bytes { content_type: None, .. } | RequestBody::Multipart(_) => {},
	}

	headers.extend(caller);

	if let Some(token) = token {
		let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
			.map_err(|_| ConfigError::InvalidHeader { name: "Authorization" })?;

		value.set_sensitive(true);
		headers.insert(header::AUTHORIZATION, value);
	}

	Ok(ApiRequest { method, url, headers, body })
}

/// Sends `request` with `token` attached.
///
/// Returns the raw response for every HTTP status. Transport failures surface as
/// [`Error::NetworkUnreachable`], requests the transport cannot build as [`Error::Config`], and a
/// triggered `cancel` token as [`Error::Cancelled`] after dropping the in-flight call.
pub async fn execute<T>(
	transport: &T,
	request: &ApiRequest,
	token: Option<&TokenSecret>,
	cancel: Option<&CancellationToken>,
) -> Result<ApiResponse>
where
	T: ?Sized + HttpTransport,
{
	if cancel.is_some_and(CancellationToken::is_cancelled) {
		return Err(Error::Cancelled);
	}

	let prepared = prepare(request.clone(), token)?;
	let sent = match until_cancelled(transport.send(prepared), cancel).await {
		Some(sent) => sent,
		None => return Err(Error::Cancelled),
	};

	sent.map_err(|e| match e {
		TransportError::Build { source } => Error::Config(ConfigError::HttpRequest { source }),
		e => Error::NetworkUnreachable(e),
	})
}

/// Drives `fut` to completion unless `cancel` fires first, in which case `fut` is dropped.
pub(crate) async fn until_cancelled<F>(fut: F, cancel: Option<&CancellationToken>) -> Option<F::Output>
where
	F: Future,
{
	match cancel {
		Some(cancel) => tokio::select! {
			biased;
			_ = cancel.cancelled() => None,
			output = fut => Some(output),
		},
		None => Some(fut.await),
	}
}
