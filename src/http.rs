use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Build the value of an `Authorization` header for HTTP Basic authentication.
///
/// Azure DevOps accepts either an account password or a personal access token
/// as `secret`.
pub fn basic_auth_header(user: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{secret}")))
}

/// A username / password-or-PAT pair.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn authorization(&self) -> String {
        basic_auth_header(&self.username, &self.secret)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// Parse a caller-supplied HTTP method name (case-insensitive).
pub fn parse_method(method: &str) -> Result<Method> {
    let method = match method.trim().to_ascii_uppercase().as_str() {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "PATCH" => Method::PATCH,
        "DELETE" => Method::DELETE,
        "HEAD" => Method::HEAD,
        "OPTIONS" => Method::OPTIONS,
        other => bail!("Unsupported HTTP method '{other}'"),
    };
    Ok(method)
}

/// One outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub credentials: Option<Credentials>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            credentials: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn headers(mut self, headers: Option<HashMap<String, String>>) -> Self {
        self.headers.extend(headers.unwrap_or_default());
        self
    }

    pub fn basic_auth(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Send `body` verbatim.
    pub fn text_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialise `body` as JSON, adding `Content-Type: application/json`
    /// unless the caller already set a content type.
    pub fn json_body(mut self, body: &Value) -> Self {
        if !self.has_header(CONTENT_TYPE.as_str()) {
            self.headers
                .insert(CONTENT_TYPE.to_string(), "application/json".to_string());
        }
        self.body = Some(body.to_string());
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case(name))
    }
}

/// Response body, classified by the `Content-Type` header.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

impl fmt::Display for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Json(value) => match serde_json::to_string_pretty(value) {
                Ok(pretty) => f.write_str(&pretty),
                Err(_) => write!(f, "{value}"),
            },
            ResponseBody::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into an error carrying the status and body text.
    pub fn error_for_status(self) -> Result<Self> {
        if !self.is_success() {
            bail!("Request failed with status {}: {}", self.status, self.body);
        }
        Ok(self)
    }

    /// Return the JSON body, or an error if the server answered with text.
    pub fn into_json(self) -> Result<Value> {
        match self.body {
            ResponseBody::Json(value) => Ok(value),
            ResponseBody::Text(text) => bail!("Expected a JSON response but received: {text}"),
        }
    }

    /// `Status: ...` / `Response: ...` rendering used by the passthrough tools.
    pub fn summary(&self) -> String {
        format!("Status: {}\nResponse: {}", self.status, self.body)
    }
}

/// Perform one outbound request.
///
/// A response whose `Content-Type` contains `application/json` is parsed as
/// JSON; anything else is returned as raw text.  Non-2xx statuses are *not*
/// errors here, see [`HttpResponse::error_for_status`].
pub async fn send(client: &Client, request: HttpRequest) -> Result<HttpResponse> {
    let HttpRequest {
        method,
        url,
        headers,
        body,
        credentials,
    } = request;

    tracing::debug!(%method, %url, "Sending HTTP request");

    let mut builder = client.request(method.clone(), &url);
    for (name, value) in &headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(credentials) = &credentials {
        builder = builder.header(AUTHORIZATION, credentials.authorization());
    }
    if let Some(body) = body {
        builder = builder.body(body);
    }

    let response = builder
        .send()
        .await
        .with_context(|| format!("{method} {url} failed"))?;

    let status = response.status().as_u16();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    let text = response
        .text()
        .await
        .with_context(|| format!("Failed to read response body from {url}"))?;

    let body = if is_json && !text.trim().is_empty() {
        ResponseBody::Json(
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse JSON response from {url}"))?,
        )
    } else {
        ResponseBody::Text(text)
    };

    tracing::debug!(status, %url, "Received HTTP response");

    Ok(HttpResponse { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn basic_auth_header_encodes_user_and_secret() {
        assert_eq!(basic_auth_header("user", "pass"), "Basic dXNlcjpwYXNz");
        assert_eq!(basic_auth_header("", "pat"), "Basic OnBhdA==");
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let rendered = format!("{:?}", Credentials::new("alice", "hunter2"));
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn parse_method_is_case_insensitive() {
        assert_eq!(parse_method("get").unwrap(), Method::GET);
        assert_eq!(parse_method(" Patch ").unwrap(), Method::PATCH);
        assert!(parse_method("FETCH").is_err());
    }

    #[test]
    fn json_body_respects_caller_content_type() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/vnd.custom+json".to_string());
        let request = HttpRequest::post("http://localhost")
            .headers(Some(headers))
            .json_body(&json!({"a": 1}));
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.body.as_deref(), Some(r#"{"a":1}"#));
    }

    #[test]
    fn error_for_status_includes_status_code() {
        let response = HttpResponse {
            status: 404,
            body: ResponseBody::Text("not here".into()),
        };
        let err = response.error_for_status().unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("not here"));
    }

    #[tokio::test]
    async fn json_content_type_is_parsed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/thing");
                then.status(200)
                    .header("content-type", "application/json; charset=utf-8")
                    .body(r#"{"id": 7}"#);
            })
            .await;

        let response = send(&Client::new(), HttpRequest::get(server.url("/thing")))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, ResponseBody::Json(json!({"id": 7})));
    }

    #[tokio::test]
    async fn other_content_types_are_returned_as_text() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/echo").body("ping");
                then.status(201)
                    .header("content-type", "text/plain")
                    .body("pong");
            })
            .await;

        let response = send(
            &Client::new(),
            HttpRequest::post(server.url("/echo")).text_body("ping"),
        )
        .await
        .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, ResponseBody::Text("pong".into()));
        assert_eq!(response.summary(), "Status: 201\nResponse: pong");
    }

    #[tokio::test]
    async fn malformed_json_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/broken");
                then.status(200)
                    .header("content-type", "application/json")
                    .body("{not json");
            })
            .await;

        let err = send(&Client::new(), HttpRequest::get(server.url("/broken")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to parse JSON"));
    }

    #[tokio::test]
    async fn basic_auth_is_sent_once() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/secure")
                    .header("authorization", "Basic dXNlcjpwYXNz");
                then.status(200).body("ok");
            })
            .await;

        let request =
            HttpRequest::get(server.url("/secure")).basic_auth(Credentials::new("user", "pass"));
        send(&Client::new(), request).await.unwrap();

        mock.assert_calls_async(1).await;
    }
}
