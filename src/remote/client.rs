// ABOUTME: HTTP client for the remote OData service
// ABOUTME: Handles paged collection reads, the CSRF handshake and entity POSTs

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::models::{extract_rows, CSRF_HEADER};
use super::{CredentialProvider, RemoteApi};
use crate::error::SyncError;
use crate::filter::set_query_pairs;
use crate::mapper::Row;

pub struct ODataClient {
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl ODataClient {
    pub fn new(timeout: Duration, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            credentials,
        })
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let request = request.header(reqwest::header::ACCEPT, "application/json");
        match self.credentials.bearer().await? {
            Some(token) => Ok(request.bearer_auth(token)),
            None => Ok(request),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|e| SyncError::Transport {
            status: None,
            body: e.to_string(),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Transport {
                status: Some(status.as_u16()),
                body,
            }
            .into());
        }
        Ok(response)
    }
}

/// Set `$top`/`$skip` on `url`, replacing any values it already carries.
pub fn page_url(url: &str, skip: usize, top: usize) -> Result<String> {
    let mut parsed = Url::parse(url).with_context(|| format!("Invalid collection URL '{}'", url))?;
    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .into_owned()
        .filter(|(k, _)| k != "$top" && k != "$skip")
        .collect();
    pairs.push(("$top".to_string(), top.to_string()));
    pairs.push(("$skip".to_string(), skip.to_string()));
    set_query_pairs(&mut parsed, &pairs);
    Ok(parsed.into())
}

#[async_trait]
impl RemoteApi for ODataClient {
    async fn fetch_page(&self, url: &str, skip: usize, top: usize) -> Result<Vec<Row>> {
        let url = page_url(url, skip, top)?;
        debug!(%url, "Fetching OData page");

        let request = self.authorize(self.client.get(&url)).await?;
        let response = self.send(request).await?;
        let body: Value = response
            .json()
            .await
            .context("Failed to parse OData collection response")?;
        extract_rows(body)
    }

    async fn fetch_csrf_token(&self, url: &str) -> Result<String> {
        let request = self
            .authorize(self.client.get(url).header(CSRF_HEADER, "Fetch"))
            .await?;
        let response = self.send(request).await?;

        let token = response
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("required"));

        match token {
            Some(token) => Ok(token),
            None => Err(SyncError::Transport {
                status: Some(response.status().as_u16()),
                body: "remote did not return a CSRF token".to_string(),
            }
            .into()),
        }
    }

    async fn post(&self, url: &str, csrf_token: &str, body: &Value) -> Result<Value> {
        let request = self
            .authorize(self.client.post(url).header(CSRF_HEADER, csrf_token).json(body))
            .await?;
        let response = self.send(request).await?;

        let text = response
            .text()
            .await
            .context("Failed to read POST response body")?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).context("Failed to parse POST response body")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::duplicate_body;
    use crate::remote::StaticToken;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn client(token: Option<&str>) -> ODataClient {
        ODataClient::new(
            Duration::from_secs(5),
            Arc::new(StaticToken::new(token.map(str::to_string))),
        )
        .unwrap()
    }

    fn http_response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut out = format!("HTTP/1.1 {}\r\n", status);
        for (name, value) in headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ));
        out
    }

    /// Read one request, headers and body, as lowercase text.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).to_lowercase()
    }

    /// Serve `response` to a single connection. The handle yields the request.
    async fn serve_once(response: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request
        });
        (format!("http://{}/odata/Orders", addr), handle)
    }

    #[test]
    fn test_client_creation() {
        let client = ODataClient::new(Duration::from_secs(30), Arc::new(StaticToken::new(None)));
        assert!(client.is_ok());
    }

    #[test]
    fn test_page_url_replaces_paging_params() {
        let url = page_url(
            "https://h/odata/Orders?$top=5&$filter=A%20eq%201&$skip=9",
            200,
            100,
        )
        .unwrap();
        assert_eq!(
            url,
            "https://h/odata/Orders?$filter=A%20eq%201&$top=100&$skip=200"
        );
    }

    #[tokio::test]
    async fn test_fetch_page_sends_paging_and_bearer() {
        let body = json!({"d": {"results": [{"Id": "1"}, {"Id": "2"}]}}).to_string();
        let (url, server) = serve_once(http_response("200 OK", &[], &body)).await;

        let rows = client(Some("secret")).fetch_page(&url, 0, 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["Id"], "2");

        let request = server.await.unwrap();
        assert!(request.starts_with("get /odata/orders?$top=2&$skip=0 "));
        assert!(request.contains("authorization: bearer secret"));
        assert!(request.contains("accept: application/json"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_transport_error() {
        let body = r#"{"error":{"message":"bad filter"}}"#;
        let (url, server) = serve_once(http_response("400 Bad Request", &[], body)).await;

        let err = client(None).fetch_page(&url, 0, 10).await.unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::Transport { status, body: text }) => {
                assert_eq!(*status, Some(400));
                assert_eq!(text, body);
            }
            other => panic!("unexpected error {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_csrf_fetch_returns_token() {
        let (url, server) = serve_once(http_response(
            "200 OK",
            &[("x-csrf-token", "tok-123")],
            "{}",
        ))
        .await;

        let token = client(None).fetch_csrf_token(&url).await.unwrap();
        assert_eq!(token, "tok-123");
        assert!(server.await.unwrap().contains("x-csrf-token: fetch"));
    }

    #[tokio::test]
    async fn test_csrf_missing_token_is_rejected() {
        let (url, server) = serve_once(http_response("200 OK", &[], "{}")).await;

        let err = client(None).fetch_csrf_token(&url).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Transport { status: Some(200), .. })
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_csrf_required_echo_is_rejected() {
        let (url, server) = serve_once(http_response(
            "200 OK",
            &[("x-csrf-token", "Required")],
            "{}",
        ))
        .await;

        let err = client(None).fetch_csrf_token(&url).await.unwrap_err();
        assert!(err.to_string().contains("CSRF token"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_post_with_empty_body_is_null() {
        let (url, server) = serve_once(http_response("201 Created", &[], "")).await;

        let response = client(None)
            .post(&url, "tok-123", &json!({"OrderNo": "A1"}))
            .await
            .unwrap();
        assert_eq!(response, Value::Null);

        let request = server.await.unwrap();
        assert!(request.starts_with("post /odata/orders "));
        assert!(request.contains("x-csrf-token: tok-123"));
        assert!(request.ends_with(r#"{"orderno":"a1"}"#));
    }

    #[tokio::test]
    async fn test_post_echo_is_parsed() {
        let body = json!({"d": {"OrderNo": "A1"}}).to_string();
        let (url, server) = serve_once(http_response("201 Created", &[], &body)).await;

        let response = client(None)
            .post(&url, "tok", &json!({"OrderNo": "A1"}))
            .await
            .unwrap();
        assert_eq!(response["d"]["OrderNo"], "A1");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_code_past_long_message_is_detected() {
        let body = format!(
            r#"{{"error":{{"message":"{}","innererror":{{"errordetails":[{{"code":"DBSQL_DUPLICATE_KEY_ERROR"}}]}}}}}}"#,
            "x".repeat(1100)
        );
        let (url, server) = serve_once(http_response("400 Bad Request", &[], &body)).await;

        let err = client(None)
            .post(&url, "tok", &json!({"OrderNo": "A1"}))
            .await
            .unwrap_err();
        let codes = vec!["DBSQL_DUPLICATE_KEY_ERROR".to_string()];
        assert_eq!(duplicate_body(&err, &codes).as_deref(), Some(body.as_str()));
        server.await.unwrap();
    }
}
