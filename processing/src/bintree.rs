//! Untyped rendering of protobuf-style wire data.
//!
//! Some networks answer with length-delimited binary messages whose schema
//! is unknown.  They are decoded into a [`Node`] tree by guessing:
//! length-delimited fields become text when they read as printable UTF-8,
//! nested structs when they parse as a message, and bytes otherwise.
//! Fields seen more than once are grouped into [`Node::Repeated`].
//!
//! Access is by field number (structs) or position (repeated lists), and
//! every lookup returns an `Option`, so a response of a different shape is
//! a miss rather than a panic.

use serde_json::{Map, Value as Json};

/// Nesting beyond this is treated as opaque bytes.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Varint(u64),
    Fixed(u64),
    Bytes(Vec<u8>),
    Utf8(String),
    Struct(Vec<(u64, Node)>),
    Repeated(Vec<Node>),
}

impl Node {
    /// Field `key` of a struct, or item `key` of a repeated list.
    pub fn get(&self, key: u64) -> Option<&Node> {
        match self {
            Node::Struct(fields) => fields.iter().find(|(id, _)| *id == key).map(|(_, n)| n),
            Node::Repeated(items) => usize::try_from(key).ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    pub fn path(&self, keys: &[u64]) -> Option<&Node> {
        keys.iter().try_fold(self, |node, &k| node.get(k))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Node::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// JSON rendering; bytes become space-separated hex.
    pub fn to_json(&self) -> Json {
        match self {
            Node::Varint(v) | Node::Fixed(v) => Json::from(*v),
            Node::Utf8(s) => Json::from(s.as_str()),
            Node::Bytes(b) => Json::from(
                b.iter()
                    .map(|x| format!("{x:02x}"))
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            Node::Struct(fields) => {
                let mut map = Map::new();
                for (id, node) in fields {
                    map.insert(id.to_string(), node.to_json());
                }
                Json::Object(map)
            }
            Node::Repeated(items) => Json::Array(items.iter().map(Node::to_json).collect()),
        }
    }
}

/// Decode a whole message; `None` if the bytes are not wire-format data.
pub fn parse(data: &[u8]) -> Option<Node> {
    parse_fields(data, 0).map(Node::Struct)
}

fn parse_fields(mut data: &[u8], depth: usize) -> Option<Vec<(u64, Node)>> {
    let mut fields: Vec<(u64, Node)> = Vec::new();
    while !data.is_empty() {
        let tag = read_varint(&mut data)?;
        let field = tag >> 3;
        if field == 0 {
            return None;
        }
        let node = match tag & 7 {
            0 => Node::Varint(read_varint(&mut data)?),
            1 => Node::Fixed(u64::from_le_bytes(take(&mut data, 8)?.try_into().ok()?)),
            2 => {
                let len = usize::try_from(read_varint(&mut data)?).ok()?;
                classify_bytes(take(&mut data, len)?, depth)
            }
            5 => Node::Fixed(u32::from_le_bytes(take(&mut data, 4)?.try_into().ok()?) as u64),
            // Groups (3, 4) and reserved types do not occur in these payloads.
            _ => return None,
        };
        push_field(&mut fields, field, node);
    }
    Some(fields)
}

fn push_field(fields: &mut Vec<(u64, Node)>, field: u64, node: Node) {
    match fields.iter_mut().find(|(id, _)| *id == field) {
        Some((_, Node::Repeated(items))) => items.push(node),
        Some((_, existing)) => {
            let first = std::mem::replace(existing, Node::Repeated(Vec::new()));
            *existing = Node::Repeated(vec![first, node]);
        }
        None => fields.push((field, node)),
    }
}

fn classify_bytes(bytes: &[u8], depth: usize) -> Node {
    let text = std::str::from_utf8(bytes).ok();
    if let Some(t) = text {
        if t.chars().all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t')) {
            return Node::Utf8(t.to_string());
        }
    }
    if depth < MAX_DEPTH {
        if let Some(fields) = parse_fields(bytes, depth + 1).filter(|f| !f.is_empty()) {
            return Node::Struct(fields);
        }
    }
    match text {
        Some(t) => Node::Utf8(t.to_string()),
        None => Node::Bytes(bytes.to_vec()),
    }
}

fn read_varint(data: &mut &[u8]) -> Option<u64> {
    let mut value = 0u64;
    for i in 0..10 {
        let (&byte, rest) = data.split_first()?;
        *data = rest;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

fn take<'a>(data: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if data.len() < n {
        return None;
    }
    let (head, rest) = data.split_at(n);
    *data = rest;
    Some(head)
}
