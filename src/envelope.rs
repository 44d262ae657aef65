//! Transport-agnostic request/response shapes.
//!
//! Both transports consume a [`RequestEnvelope`] and produce a
//! [`ResponseEnvelope`], so callers never see which one served them.

use hyper::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

pub const CONTENT_TYPE_JSON: &str = "application/json";
const LOCAL_ORIGIN: &str = "http://localhost/";

// ============================================================================
// Request
// ============================================================================

/// Scalar query-string value. `Null` entries are dropped when the query
/// string is assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryValue::Null => Ok(()),
            QueryValue::Bool(b) => write!(f, "{}", b),
            QueryValue::Number(n) => write!(f, "{}", n),
            QueryValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Text(value.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        QueryValue::Text(value)
    }
}

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        QueryValue::Bool(value)
    }
}

impl From<i64> for QueryValue {
    fn from(value: i64) -> Self {
        QueryValue::Number(value.into())
    }
}

impl From<u64> for QueryValue {
    fn from(value: u64) -> Self {
        QueryValue::Number(value.into())
    }
}

/// Request body: raw text, or a JSON value serialized on the way out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestBody {
    Text(String),
    Json(Value),
}

impl RequestBody {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            RequestBody::Text(text) => text.as_bytes().to_vec(),
            RequestBody::Json(value) => value.to_string().into_bytes(),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            RequestBody::Text(text) => text,
            RequestBody::Json(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, QueryValue>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestBody>,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn with_text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(RequestBody::Text(body.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Adds `content-type: application/json` unless the caller set one.
    pub fn ensure_content_type(&mut self) {
        if self.header("content-type").is_none() {
            self.headers
                .insert("content-type".to_string(), CONTENT_TYPE_JSON.to_string());
        }
    }

    /// Query pairs in assembly order, nulls dropped.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .iter()
            .filter(|(_, v)| !matches!(v, QueryValue::Null))
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }

    /// Resolve against `base`. The path only ever replaces the path and
    /// query of `base`; scheme, host and port never change.
    pub fn resolve_url(&self, base: &Url) -> Url {
        let raw = self.path.split('#').next().unwrap_or_default();
        let (path, query) = match raw.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (raw, None),
        };

        let mut url = base.clone();
        url.set_path(&format!("/{}", path.trim_start_matches(|c: char| c == '/' || c == '\\')));
        url.set_query(query.filter(|q| !q.is_empty()));
        url.set_fragment(None);

        let pairs = self.query_pairs();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        url
    }

    /// Origin-form request target, encoded exactly as [`resolve_url`](Self::resolve_url) does.
    pub fn path_and_query(&self) -> Result<String, url::ParseError> {
        let url = self.resolve_url(&Url::parse(LOCAL_ORIGIN)?);
        Ok(match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        })
    }

    /// Copy with a JSON body flattened to text, the shape framed peers expect.
    pub fn with_text_body(&self) -> Self {
        let mut copy = self.clone();
        copy.body = copy.body.take().map(|b| RequestBody::Text(b.into_text()));
        copy
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// `500` with a JSON `{"error": ...}` body.
    pub fn internal_error(message: impl fmt::Display) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), CONTENT_TYPE_JSON.to_string());
        Self {
            status: 500,
            headers,
            body: serde_json::json!({ "error": message.to_string() }).to_string(),
        }
    }
}

/// Flatten a header map; repeated headers are joined with `, `.
pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}
