//! Forwarding handler for the origin behind the cache.

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderName, Request, StatusCode, Uri,
        header::{
            CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
            TRANSFER_ENCODING, UPGRADE,
        },
    },
    response::{IntoResponse, Response},
};
use http_body::Body as _;
use reqwest::{Client, redirect::Policy};
use tracing::warn;
use url::Url;

use crate::config::UpstreamSettings;

use super::error::InfraError;

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Streams requests to a single origin and the origin's responses back.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    client: Client,
    base: Url,
}

impl UpstreamProxy {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            base: settings.url.clone(),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("routecache/", env!("CARGO_PKG_VERSION"))
    }

    /// Origin URL for an inbound request: the base path followed by the
    /// request path, with the request query.
    pub fn target_url(&self, uri: &Uri) -> Url {
        let mut url = self.base.clone();
        let base_path = self.base.path().trim_end_matches('/');
        url.set_path(&format!("{base_path}{}", uri.path()));
        url.set_query(uri.query());
        url
    }

    pub async fn forward(&self, request: Request<Body>) -> Result<Response, reqwest::Error> {
        let (parts, body) = request.into_parts();
        let url = self.target_url(&parts.uri);

        let mut headers = strip_hop_by_hop(&parts.headers);
        if let Some(host) = headers.remove(HOST) {
            headers.insert(X_FORWARDED_HOST, host);
        }

        let mut outbound = self.client.request(parts.method, url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = outbound.send().await?;

        let mut response = Response::new(Body::empty());
        *response.status_mut() = upstream.status();
        *response.version_mut() = upstream.version();
        *response.headers_mut() = strip_hop_by_hop(upstream.headers());
        *response.body_mut() = Body::from_stream(upstream.bytes_stream());
        Ok(response)
    }
}

/// Axum handler forwarding every request to the configured origin.
pub async fn proxy_handler(State(proxy): State<UpstreamProxy>, request: Request<Body>) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match proxy.forward(request).await {
        Ok(response) => response,
        Err(err) => {
            let status = if err.is_timeout() {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            };
            warn!(
                target = "routecache::infra::upstream",
                op = "upstream::forward",
                result = "error",
                %method,
                path = %path,
                status = status.as_u16(),
                error = %err,
                "Upstream request failed"
            );
            status.into_response()
        }
    }
}

/// Copy `headers` without connection-scoped fields, including any named in
/// `Connection`.
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    listed.extend([
        CONNECTION,
        KEEP_ALIVE,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ]);

    let mut copy = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !listed.contains(name) {
            copy.append(name.clone(), value.clone());
        }
    }
    copy
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::HeaderValue;

    use super::*;

    fn proxy(base: &str) -> UpstreamProxy {
        UpstreamProxy::new(&UpstreamSettings {
            url: Url::parse(base).unwrap(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn target_url_joins_base_path_and_keeps_query() {
        let proxy = proxy("http://origin.example:8000/app/");
        let uri: Uri = "/items/7?page=2&sort=asc".parse().unwrap();
        assert_eq!(
            proxy.target_url(&uri).as_str(),
            "http://origin.example:8000/app/items/7?page=2&sort=asc"
        );

        let root = self::proxy("http://origin.example");
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(root.target_url(&uri).as_str(), "http://origin.example/");
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-session-hop"));
        headers.insert(KEEP_ALIVE, HeaderValue::from_static("timeout=5"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-session-hop", HeaderValue::from_static("1"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let stripped = strip_hop_by_hop(&headers);
        assert!(!stripped.contains_key(CONNECTION));
        assert!(!stripped.contains_key(KEEP_ALIVE));
        assert!(!stripped.contains_key(TRANSFER_ENCODING));
        assert!(!stripped.contains_key("x-session-hop"));
        assert_eq!(stripped.get_all("set-cookie").iter().count(), 2);
    }
}
