//! Flow reader – turns a proxy flow dump into [`ExchangeRecord`]s.
//!
//! The reader is lazy and single-pass.  A file that cannot be opened, or
//! whose first record is garbage, is [`ScanError::CaptureUnreadable`]; a
//! malformed record later on ends the stream with a warning.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use tracing::{debug, warn};

use adscan_common::error::ScanError;
use adscan_common::exchange::{timestamp_to_utc, ExchangeRecord, Headers};

use crate::tnetstring::{TnetReader, Value};

/// Connectivity checks and emulator housekeeping; never ad traffic.
pub const IGNORED_URLS: &[&str] = &[
    "https://connectivitycheck.gstatic.com/generate_204",
    "http://connectivitycheck.gstatic.com/generate_204",
    "https://www.google.com/generate_204",
    "https://infinitedata-pa.googleapis.com/mdi.InfiniteData/Lookup",
    "https://android.apis.google.com/c2dm/register3",
    "https://ota.waydro.id/system/lineage/waydroid_x86_64/GAPPS.json",
];

pub struct FlowReader {
    path: PathBuf,
    reader: TnetReader<BufReader<File>>,
    pending: Option<Value>,
    seq: usize,
    done: bool,
}

impl FlowReader {
    /// Open a capture and validate its first record.
    pub fn open(path: &Path) -> Result<Self, ScanError> {
        let unreadable = |reason: String| ScanError::CaptureUnreadable {
            path: path.to_path_buf(),
            reason,
        };
        let file = File::open(path).map_err(|e| unreadable(e.to_string()))?;
        let mut reader = TnetReader::new(BufReader::new(file));
        let first = reader.next_value().map_err(|e| unreadable(e.to_string()))?;
        if let Some(v) = &first {
            if !matches!(v, Value::Dict(_)) {
                return Err(unreadable("first record is not a flow".into()));
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            done: first.is_none(),
            reader,
            pending: first,
            seq: 0,
        })
    }
}

impl Iterator for FlowReader {
    type Item = ExchangeRecord;

    fn next(&mut self) -> Option<ExchangeRecord> {
        loop {
            if self.done {
                return None;
            }
            let value = match self.pending.take() {
                Some(v) => v,
                None => match self.reader.next_value() {
                    Ok(Some(v)) => v,
                    Ok(None) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        warn!(
                            "Capture {} truncated after {} flows: {e}",
                            self.path.display(),
                            self.seq
                        );
                        self.done = true;
                        return None;
                    }
                },
            };
            self.seq += 1;
            match flow_to_record(&value, self.seq) {
                Some(record) if IGNORED_URLS.contains(&record.url.as_str()) => {
                    debug!("Skipping infrastructure URL {}", record.url);
                }
                Some(record) => return Some(record),
                None => {}
            }
        }
    }
}

/// Read a whole capture into memory.
pub fn read_capture(path: &Path) -> Result<Vec<ExchangeRecord>, ScanError> {
    Ok(FlowReader::open(path)?.collect())
}

// ── flow conversion ──────────────────────────────────────────────────────

fn flow_to_record(flow: &Value, seq: usize) -> Option<ExchangeRecord> {
    let id = flow
        .get("id")
        .and_then(Value::as_text)
        .unwrap_or_else(|| format!("flow-{seq}"));
    match flow.get("type").and_then(Value::as_text).as_deref() {
        Some("http") => http_record(id, flow),
        Some("tcp") => tcp_record(id, flow),
        other => {
            warn!("Skipping flow {id} of unsupported type {other:?}");
            None
        }
    }
}

fn http_record(id: String, flow: &Value) -> Option<ExchangeRecord> {
    let Some(request) = flow.get("request") else {
        warn!("HTTP flow {id} has no request");
        return None;
    };
    let text = |v: &Value, key: &str| v.get(key).and_then(Value::as_text).unwrap_or_default();

    let host = text(request, "host");
    let scheme = Some(text(request, "scheme"))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "https".to_string());
    let port = request.get("port").and_then(Value::as_int);
    let path = text(request, "path");
    let url = match port {
        Some(p) if !is_default_port(&scheme, p) => format!("{scheme}://{host}:{p}{path}"),
        _ => format!("{scheme}://{host}{path}"),
    };
    let start = request
        .get("timestamp_start")
        .and_then(Value::as_float)
        .unwrap_or_default();
    let request_headers = headers(request.get("headers"));
    let request_body = body(&request_headers, request.get("content"));

    let response = flow.get("response").filter(|r| !r.is_null());
    let status = response
        .and_then(|r| r.get("status_code"))
        .and_then(Value::as_int)
        .and_then(|s| u16::try_from(s).ok());
    let response_headers = response.map(|r| headers(r.get("headers"))).unwrap_or_default();
    let response_body = response
        .and_then(|r| r.get("content"))
        .filter(|c| !c.is_null())
        .map(|c| body(&response_headers, Some(c)));

    Some(ExchangeRecord::http(
        id,
        timestamp_to_utc(start),
        text(request, "method"),
        url,
        host,
        request_headers,
        request_body,
        status,
        response_headers,
        response_body,
    ))
}

fn tcp_record(id: String, flow: &Value) -> Option<ExchangeRecord> {
    let address = flow
        .get("server_conn")
        .and_then(|c| c.get("address"))
        .and_then(Value::as_list);
    let host = address
        .and_then(|a| a.first())
        .and_then(Value::as_text)
        .unwrap_or_default();
    let messages = flow.get("messages").and_then(Value::as_list).unwrap_or_default();
    let bytes: u64 = messages
        .iter()
        .filter_map(|m| m.as_list()?.get(1)?.as_bytes().map(|b| b.len() as u64))
        .sum();
    let start = messages
        .first()
        .and_then(|m| m.as_list()?.get(2)?.as_float())
        .or_else(|| {
            flow.get("client_conn")
                .and_then(|c| c.get("timestamp_start"))
                .and_then(Value::as_float)
        })
        .unwrap_or_default();
    Some(ExchangeRecord::tcp(id, timestamp_to_utc(start), host, bytes))
}

fn is_default_port(scheme: &str, port: i64) -> bool {
    matches!((scheme, port), ("https", 443) | ("http", 80))
}

fn headers(value: Option<&Value>) -> Headers {
    value
        .and_then(Value::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(|pair| {
            let pair = pair.as_list()?;
            Some((pair.first()?.as_text()?, pair.get(1)?.as_text()?))
        })
        .collect()
}

/// Body bytes with any `Content-Encoding` removed.  Undecodable bodies are
/// kept as transferred.
fn body(headers: &Headers, content: Option<&Value>) -> Vec<u8> {
    let raw = content.and_then(Value::as_bytes).unwrap_or_default();
    let encoding = headers
        .get("Content-Encoding")
        .map(|e| e.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let decoded = match encoding.as_str() {
        "gzip" | "x-gzip" => read_all(GzDecoder::new(raw)),
        "deflate" => read_all(ZlibDecoder::new(raw)).or_else(|| read_all(DeflateDecoder::new(raw))),
        _ => None,
    };
    match decoded {
        Some(d) => d,
        None => {
            if !encoding.is_empty() && encoding != "identity" {
                debug!("Keeping {encoding} body of {} bytes undecoded", raw.len());
            }
            raw.to_vec()
        }
    }
}

fn read_all(mut reader: impl Read) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).ok().map(|_| out)
}
