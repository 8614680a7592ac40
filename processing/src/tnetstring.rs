//! Tagged netstring codec used by the capture proxy's flow dumps.
//!
//! Every value is framed as `<len>:<payload><tag>`:
//!
//! | tag | payload            |
//! |-----|--------------------|
//! | `,` | raw bytes          |
//! | `;` | UTF-8 text         |
//! | `#` | decimal integer    |
//! | `^` | decimal float      |
//! | `!` | `true` / `false`   |
//! | `~` | empty (null)       |
//! | `]` | concatenated items |
//! | `}` | key, value, ...    |

use std::io::{BufRead, ErrorKind, Read};

/// Longest length prefix accepted (protects against reading garbage as a
/// multi-gigabyte length).
const MAX_LEN_DIGITS: usize = 12;

/// Deepest list/dict nesting decoded before giving up.
const MAX_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TnetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad length prefix")]
    BadLength,
    #[error("truncated value: wanted {wanted} bytes")]
    Truncated { wanted: usize },
    #[error("unknown type tag {0:?}")]
    UnknownTag(char),
    #[error("invalid {kind} payload")]
    BadPayload { kind: &'static str },
}

/// A decoded tnetstring value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bytes(Vec<u8>),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    List(Vec<Value>),
    /// Keys are kept in file order; byte keys are converted lossily.
    Dict(Vec<(String, Value)>),
}

impl Value {
    /// Dictionary lookup; `None` for non-dicts and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(items) => items.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Text view of a string or bytes value; invalid UTF-8 is replaced.
    pub fn as_text(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

// ── decoding ─────────────────────────────────────────────────────────────

/// Parse one value from the front of `data`, returning it and the rest.
pub fn parse(data: &[u8]) -> Result<(Value, &[u8]), TnetError> {
    parse_at(data, 0)
}

fn parse_at(data: &[u8], depth: usize) -> Result<(Value, &[u8]), TnetError> {
    let colon = data
        .iter()
        .take(MAX_LEN_DIGITS + 1)
        .position(|&b| b == b':')
        .ok_or(TnetError::BadLength)?;
    let len = parse_len(&data[..colon])?;
    let body_start = colon + 1;
    let tag_pos = body_start.saturating_add(len);
    if data.len() <= tag_pos {
        return Err(TnetError::Truncated { wanted: len.saturating_add(1) });
    }
    let value = decode_payload(&data[body_start..tag_pos], data[tag_pos], depth)?;
    Ok((value, &data[tag_pos + 1..]))
}

fn parse_len(digits: &[u8]) -> Result<usize, TnetError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(TnetError::BadLength);
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(TnetError::BadLength)
}

fn decode_payload(payload: &[u8], tag: u8, depth: usize) -> Result<Value, TnetError> {
    if matches!(tag, b']' | b'}') && depth >= MAX_DEPTH {
        return Err(TnetError::BadPayload { kind: "nesting" });
    }
    let text = |kind| std::str::from_utf8(payload).map_err(|_| TnetError::BadPayload { kind });
    Ok(match tag {
        b',' => Value::Bytes(payload.to_vec()),
        b';' => Value::Str(text("string")?.to_string()),
        b'#' => Value::Int(
            text("integer")?
                .parse()
                .map_err(|_| TnetError::BadPayload { kind: "integer" })?,
        ),
        b'^' => Value::Float(
            text("float")?
                .parse()
                .map_err(|_| TnetError::BadPayload { kind: "float" })?,
        ),
        b'!' => match payload {
            b"true" => Value::Bool(true),
            b"false" => Value::Bool(false),
            _ => return Err(TnetError::BadPayload { kind: "boolean" }),
        },
        b'~' => {
            if !payload.is_empty() {
                return Err(TnetError::BadPayload { kind: "null" });
            }
            Value::Null
        }
        b']' => {
            let mut items = Vec::new();
            let mut rest = payload;
            while !rest.is_empty() {
                let (item, tail) = parse_at(rest, depth + 1)?;
                items.push(item);
                rest = tail;
            }
            Value::List(items)
        }
        b'}' => {
            let mut items = Vec::new();
            let mut rest = payload;
            while !rest.is_empty() {
                let (key, tail) = parse_at(rest, depth + 1)?;
                let key = key.as_text().ok_or(TnetError::BadPayload { kind: "dict key" })?;
                let (value, tail) = parse_at(tail, depth + 1)?;
                items.push((key, value));
                rest = tail;
            }
            Value::Dict(items)
        }
        other => return Err(TnetError::UnknownTag(other as char)),
    })
}

/// Streaming reader over a sequence of top-level values.
pub struct TnetReader<R> {
    inner: R,
}

impl<R: BufRead> TnetReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next top-level value, `Ok(None)` at a clean end of input.
    pub fn next_value(&mut self) -> Result<Option<Value>, TnetError> {
        let mut digits = Vec::with_capacity(MAX_LEN_DIGITS);
        loop {
            let mut byte = [0u8; 1];
            match self.inner.read(&mut byte) {
                Ok(0) if digits.is_empty() => return Ok(None),
                Ok(0) => return Err(TnetError::Truncated { wanted: 1 }),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            match byte[0] {
                b':' => break,
                // Tolerate whitespace between records.
                b'\n' | b'\r' | b' ' if digits.is_empty() => continue,
                b if b.is_ascii_digit() && digits.len() < MAX_LEN_DIGITS => digits.push(b),
                _ => return Err(TnetError::BadLength),
            }
        }
        let len = parse_len(&digits)?;
        let wanted = len.saturating_add(1);
        // Grow with the input instead of trusting the prefix up front.
        let mut body = Vec::new();
        (&mut self.inner).take(wanted as u64).read_to_end(&mut body)?;
        if body.len() < wanted {
            return Err(TnetError::Truncated { wanted });
        }
        let tag = body.pop().unwrap_or_default();
        decode_payload(&body, tag, 0).map(Some)
    }
}

// ── encoding ─────────────────────────────────────────────────────────────

/// Encode a value; used to build capture fixtures.
pub fn dump(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    let (payload, tag): (Vec<u8>, u8) = match value {
        Value::Bytes(b) => (b.clone(), b','),
        Value::Str(s) => (s.as_bytes().to_vec(), b';'),
        Value::Int(i) => (i.to_string().into_bytes(), b'#'),
        Value::Float(f) => (format!("{f:?}").into_bytes(), b'^'),
        Value::Bool(b) => (b.to_string().into_bytes(), b'!'),
        Value::Null => (Vec::new(), b'~'),
        Value::List(items) => {
            let mut buf = Vec::new();
            for item in items {
                write_value(item, &mut buf);
            }
            (buf, b']')
        }
        Value::Dict(items) => {
            let mut buf = Vec::new();
            for (k, v) in items {
                write_value(&Value::Str(k.clone()), &mut buf);
                write_value(v, &mut buf);
            }
            (buf, b'}')
        }
    };
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(&payload);
    out.push(tag);
}
