use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File {
        file_name: String,
        mime_type: String,
        bytes: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Vec<(String, FormValue)>),
}

/// Everything needed to perform one attempt. Kept as plain data so the
/// same request can be resent verbatim on retry.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout,
        }
    }

    pub fn post_json(url: impl Into<String>, payload: Value, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Json(payload),
            timeout,
        }
    }

    pub fn post_multipart(
        url: impl Into<String>,
        fields: Vec<(String, FormValue)>,
        timeout: Duration,
    ) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Multipart(fields),
            timeout,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {token}"))
    }
}

/// Status line and headers of a response; header names are lowercase.
pub trait ResponseHead {
    fn status(&self) -> u16;
    fn header(&self, name: &str) -> Option<&str>;
    /// Consumes the response and returns its body as lossy UTF-8.
    fn into_text(self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

impl ResponseHead for RawResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn into_text(self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// A response whose body is still on the wire. Dropping it closes the connection.
pub struct StreamingResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Box<dyn BufRead + Send>,
}

impl fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl ResponseHead for StreamingResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn into_text(mut self) -> String {
        let mut raw = Vec::new();
        if self.body.read_to_end(&mut raw).is_err() && raw.is_empty() {
            return String::new();
        }
        String::from_utf8_lossy(&raw).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    Connect,
    Request,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub message: String,
}

impl NetworkError {
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A single network round trip with a hard deadline. No retries here.
pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<RawResponse, NetworkError>;
    fn open_stream(&self, request: &HttpRequest) -> Result<StreamingResponse, NetworkError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }

    fn build(&self, request: &HttpRequest) -> Result<RequestBuilder, NetworkError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&request.url),
            HttpMethod::Post => self.http.post(&request.url),
        };
        builder = builder.timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(payload) => builder.json(payload),
            RequestBody::Multipart(fields) => builder.multipart(build_form(fields)?),
        })
    }

    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, NetworkError> {
        self.build(request)?
            .send()
            .map_err(|err| network_error(&request.url, err))
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &HttpRequest) -> Result<RawResponse, NetworkError> {
        let response = self.execute(request)?;
        let status = response.status().as_u16();
        let headers = collect_headers(&response);
        let body = response
            .bytes()
            .map_err(|err| network_error(&request.url, err))?
            .to_vec();
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    fn open_stream(&self, request: &HttpRequest) -> Result<StreamingResponse, NetworkError> {
        let response = self.execute(request)?;
        let status = response.status().as_u16();
        let headers = collect_headers(&response);
        Ok(StreamingResponse {
            status,
            headers,
            body: Box::new(BufReader::new(response)),
        })
    }
}

fn build_form(fields: &[(String, FormValue)]) -> Result<MultipartForm, NetworkError> {
    let mut form = MultipartForm::new();
    for (name, value) in fields {
        form = match value {
            FormValue::Text(text) => form.text(name.clone(), text.clone()),
            FormValue::File {
                file_name,
                mime_type,
                bytes,
            } => {
                let part = MultipartPart::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(mime_type)
                    .map_err(|err| {
                        NetworkError::new(
                            NetworkErrorKind::Request,
                            format!("invalid mime type '{mime_type}' for form field {name}: {err}"),
                        )
                    })?;
                form.part(name.clone(), part)
            }
        };
    }
    Ok(form)
}

fn collect_headers(response: &HttpResponse) -> BTreeMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

fn network_error(url: &str, err: reqwest::Error) -> NetworkError {
    let kind = if err.is_timeout() {
        NetworkErrorKind::Timeout
    } else if err.is_connect() {
        NetworkErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        NetworkErrorKind::Body
    } else {
        NetworkErrorKind::Request
    };
    NetworkError::new(kind, format!("request to {url} failed: {}", error_chain_text(&err)))
}

fn error_chain_text(err: &(dyn StdError + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(|last| last != trimmed).unwrap_or(true) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    parts.join(" | caused by: ")
}
