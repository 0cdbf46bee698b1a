//! Demonstrates a signed-in session whose access token expires mid-use: the first request gets a
//! 401, the client refreshes through the JSON refresh endpoint, and the request is replayed.

// std
use std::sync::Arc;
// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
use url::Url;
// self
use bearer_relay::{
	auth::Credentials,
	client::ReqwestApiClient,
	descriptor::ApiDescriptor,
	http::ReqwestTransport,
	refresh::EndpointRefresher,
	store::{CredentialStore, MemoryStore},
	token::TokenStore,
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let server = MockServer::start_async().await;
	let expired = server
		.mock_async(|when, then| {
			when.method(GET).path("/v1/profile").header("authorization", "Bearer demo-expired");
			then.status(401)
				.header("content-type", "application/json")
				.body("{\"message\":\"Token expired\"}");
		})
		.await;
	let refresh = server
		.mock_async(|when, then| {
			when.method(POST).path("/auth/refresh");
			then.status(200).header("content-type", "application/json").body(
				"{\"accessToken\":\"demo-fresh\",\"refreshToken\":\"demo-refresh-2\",\"expiresIn\":900}",
			);
		})
		.await;
	let profile = server
		.mock_async(|when, then| {
			when.method(GET).path("/v1/profile").header("authorization", "Bearer demo-fresh");
			then.status(200).header("content-type", "application/json").body("{\"name\":\"Ada\"}");
		})
		.await;
	let descriptor = ApiDescriptor::builder(Url::parse(&server.base_url())?)
		.refresh_path("/auth/refresh")
		.refresh_token_field("refreshToken")
		.build()?;
	let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::default());
	let refresher = <EndpointRefresher<ReqwestTransport>>::new(
		&descriptor,
		ReqwestTransport::default(),
		store.clone(),
	)?;
	let tokens = Arc::new(TokenStore::new(Arc::new(refresher)));
	let mut updates = tokens.subscribe();
	let client =
		ReqwestApiClient::new(descriptor, tokens.clone())?.with_credential_store(store.clone());

	client
		.sign_in(Credentials::new("demo-expired").with_refresh_token("demo-refresh-1"))
		.await?;

	let body: serde_json::Value = client.get_json("/v1/profile").await?;

	println!("Profile: {body}.");

	if updates.has_changed()? {
		let current = updates.borrow_and_update().clone();

		println!("Token observers now see: {current:?}.");
	}

	expired.assert_async().await;
	refresh.assert_async().await;
	profile.assert_async().await;

	client.sign_out().await?;

	println!("Signed out; stored session present: {}.", store.load().await?.is_some());

	Ok(())
}
