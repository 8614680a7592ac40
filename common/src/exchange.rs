//! Captured request/response exchanges.
//!
//! An [`ExchangeRecord`] is immutable once the capture reader has produced
//! it; every later stage borrows it for the duration of one run.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::domain::top_level_domain;

/// HTTP header list preserving order and duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Headers(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// What kind of flow the record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Http,
    /// Raw TCP session: only host and byte count are meaningful.
    Tcp,
}

/// One captured request/response pair.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeRecord {
    pub id: String,
    pub kind: ExchangeKind,
    pub start_time: DateTime<Utc>,
    pub method: String,
    /// Empty for TCP flows.
    pub url: String,
    pub host: String,
    /// Registrable domain of the URL (or host for TCP flows).
    pub tld: Option<String>,
    pub request_headers: Headers,
    #[serde(skip)]
    pub request_body: Vec<u8>,
    pub status: Option<u16>,
    pub response_headers: Headers,
    pub response_mime: Option<String>,
    /// Decoded (Content-Encoding removed) response body.
    #[serde(skip)]
    pub response_body: Option<Vec<u8>>,
    /// Bytes received; for TCP flows the total message volume.
    pub response_size: u64,
}

impl ExchangeRecord {
    /// Build an HTTP record, deriving `tld`, `response_mime` and
    /// `response_size` from the other fields.
    #[allow(clippy::too_many_arguments)]
    pub fn http(
        id: impl Into<String>,
        start_time: DateTime<Utc>,
        method: impl Into<String>,
        url: impl Into<String>,
        host: impl Into<String>,
        request_headers: Headers,
        request_body: Vec<u8>,
        status: Option<u16>,
        response_headers: Headers,
        response_body: Option<Vec<u8>>,
    ) -> Self {
        let url = url.into();
        let host = host.into();
        let tld = top_level_domain(&url).or_else(|| top_level_domain(&host));
        let response_mime = response_headers.get("Content-Type").map(str::to_string);
        let response_size = response_body.as_ref().map_or(0, |b| b.len() as u64);
        ExchangeRecord {
            id: id.into(),
            kind: ExchangeKind::Http,
            start_time,
            method: method.into(),
            url,
            host,
            tld,
            request_headers,
            request_body,
            status,
            response_headers,
            response_mime,
            response_body,
            response_size,
        }
    }

    /// Reduced record for a raw TCP session.
    pub fn tcp(
        id: impl Into<String>,
        start_time: DateTime<Utc>,
        host: impl Into<String>,
        bytes: u64,
    ) -> Self {
        let host = host.into();
        ExchangeRecord {
            id: id.into(),
            kind: ExchangeKind::Tcp,
            start_time,
            method: String::new(),
            url: String::new(),
            tld: top_level_domain(&host),
            host,
            request_headers: Headers::default(),
            request_body: Vec::new(),
            status: None,
            response_headers: Headers::default(),
            response_mime: None,
            response_body: None,
            response_size: bytes,
        }
    }

    /// Response body as text, invalid UTF-8 replaced.
    pub fn response_text(&self) -> String {
        self.response_body
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    /// `Content-Length` announced by the server, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.response_headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn tld_str(&self) -> &str {
        self.tld.as_deref().unwrap_or_default()
    }
}

/// Convert a capture timestamp (seconds since the epoch) to UTC.
pub fn timestamp_to_utc(secs: f64) -> DateTime<Utc> {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    Utc.timestamp_opt(whole as i64, nanos)
        .single()
        .unwrap_or_default()
}
