//! Service discovery: fetching the gateway WebSocket URL over HTTPS.

use std::collections::BTreeMap;

use reqwest::Method;

use crate::error::CheckStatus;
use crate::{Error, Result};

/// Fetch the control-gateway URL from the service's discovery endpoint.
///
/// `GET https://<host>/api/gateway` → `{"url": "<wss-url>"}`.
pub async fn fetch_gateway_url(client: &reqwest::Client, host: &str) -> Result<String> {
    let url = format!("https://{host}/api/gateway");

    let response = client
        .request(Method::GET, &url)
        .send()
        .await
        .check_status()
        .await
        .map_err(|_| Error::DiscoveryURLFetch("gateway discovery request failed"))?;

    let mut body: BTreeMap<String, String> = response
        .json()
        .await
        .map_err(|_| Error::DiscoveryURLFetch("gateway discovery response was not valid JSON"))?;

    body.remove("url")
        .ok_or(Error::DiscoveryURLFetch("response missing \"url\""))
}
