//! Negotiation handshake.
//!
//! Before the streaming socket can be opened, the hub must issue a
//! connection token. The request declares the hub name in `connectionData`
//! and the protocol version in `clientProtocol`; the response carries the
//! token in its JSON body and a session-affinity cookie in `Set-Cookie`.
//! Both are required.
//!
//! The negotiator never retries. Retry policy belongs to the controller.
//! Response compression is left to `reqwest`, which advertises and decodes
//! gzip itself.

use std::time::Duration;

use pitwall_core::config::EndpointConfig;
use pitwall_types::Credentials;
use reqwest::header::SET_COOKIE;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::error::NegotiationError;

/// Performs the negotiation handshake against the configured hub.
#[derive(Debug, Clone)]
pub struct Negotiator {
    client: reqwest::Client,
    endpoint: EndpointConfig,
    timeout: Duration,
}

impl Negotiator {
    /// Create a negotiator for `endpoint` with a per-request deadline.
    pub fn new(endpoint: EndpointConfig, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            timeout,
        }
    }

    /// Obtain fresh credentials.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] if the request fails, the hub answers
    /// with an error status, or the response lacks a connection token.
    pub async fn negotiate(&self) -> Result<Credentials, NegotiationError> {
        let url = negotiate_url(&self.endpoint)?;
        debug!(url = %url, "negotiating");

        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, &self.endpoint.user_agent)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| NegotiationError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            return Err(NegotiationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
            .collect();

        let body: Value = response
            .json()
            .await
            .map_err(|e| NegotiationError::Malformed(e.to_string()))?;

        let credentials = extract_credentials(&body, &cookies)?;
        info!(cookies = cookies.len(), "negotiation succeeded");
        Ok(credentials)
    }
}

/// The `connectionData` value naming the hub: `[{"name": hub}]`.
pub fn connection_data(hub: &str) -> String {
    serde_json::json!([{ "name": hub }]).to_string()
}

/// Build `{base_url}/negotiate?connectionData=..&clientProtocol=..`.
pub fn negotiate_url(endpoint: &EndpointConfig) -> Result<Url, NegotiationError> {
    let base = endpoint.base_url.trim_end_matches('/');
    Url::parse_with_params(
        &format!("{base}/negotiate"),
        [
            ("connectionData", connection_data(&endpoint.hub)),
            ("clientProtocol", endpoint.client_protocol.clone()),
        ],
    )
    .map_err(|e| NegotiationError::Url(e.to_string()))
}

/// Pull the token from the response body and join the cookies.
fn extract_credentials(body: &Value, cookies: &[String]) -> Result<Credentials, NegotiationError> {
    let token = body
        .get("ConnectionToken")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or(NegotiationError::MissingToken)?;
    if cookies.is_empty() {
        return Err(NegotiationError::MissingCookie);
    }
    Ok(Credentials::new(token, cookies.join("; ")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn negotiate_url_declares_hub_and_protocol() {
        let url = negotiate_url(&EndpointConfig::default()).unwrap();
        assert_eq!(url.path(), "/signalr/negotiate");

        let params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(params.contains(&("connectionData".to_owned(), r#"[{"name":"Streaming"}]"#.to_owned())));
        assert!(params.contains(&("clientProtocol".to_owned(), "1.5".to_owned())));
    }

    #[test]
    fn connection_data_is_url_encoded() {
        let url = negotiate_url(&EndpointConfig::default()).unwrap();
        let query = url.query().unwrap();
        assert!(!query.contains('{'));
        assert!(!query.contains('"'));
    }

    #[test]
    fn extracts_token_and_joins_cookies() {
        let body = json!({"ConnectionToken": "abc+/=", "ConnectionId": "x"});
        let cookies = vec![
            "GCLB=one; path=/; HttpOnly".to_owned(),
            "other=two".to_owned(),
        ];
        let credentials = extract_credentials(&body, &cookies).unwrap();
        assert_eq!(credentials.token, "abc+/=");
        assert_eq!(credentials.cookie, "GCLB=one; path=/; HttpOnly; other=two");
    }

    #[test]
    fn missing_cookie_is_an_error() {
        assert!(matches!(
            extract_credentials(&json!({"ConnectionToken": "t"}), &[]),
            Err(NegotiationError::MissingCookie)
        ));
    }

    /// Serve one HTTP response on a local port and return the base URL and
    /// the request text.
    async fn serve_once(response: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/signalr", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0_u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client hung up");
                request.extend_from_slice(&chunk[..n]);
            }
            stream.write_all(&response).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8(request).unwrap()
        });
        (base_url, server)
    }

    #[tokio::test]
    async fn negotiate_decodes_a_gzip_response() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(br#"{"ConnectionToken":"abc","ConnectionId":"1"}"#)
            .unwrap();
        let body = encoder.finish().unwrap();

        let mut response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             Content-Encoding: gzip\r\n\
             Set-Cookie: GCLB=affinity; path=/\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(&body);

        let (base_url, server) = serve_once(response).await;
        let endpoint = EndpointConfig {
            base_url,
            ..EndpointConfig::default()
        };
        let credentials = Negotiator::new(endpoint, Duration::from_secs(5))
            .negotiate()
            .await
            .unwrap();
        assert_eq!(credentials.token, "abc");
        assert_eq!(credentials.cookie, "GCLB=affinity; path=/");

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /signalr/negotiate?"));
        assert!(request.contains("accept-encoding: gzip"));
        assert!(request.contains("user-agent: besthttp"));
    }

    #[test]
    fn missing_or_empty_token_is_an_error() {
        assert!(matches!(
            extract_credentials(&json!({"ConnectionId": "x"}), &[]),
            Err(NegotiationError::MissingToken)
        ));
        assert!(matches!(
            extract_credentials(&json!({"ConnectionToken": ""}), &[]),
            Err(NegotiationError::MissingToken)
        ));
    }
}
