//! AppLovin payload cipher.
//!
//! Blobs look like `version:observed_sha1:sdk_key_postfix:payload`.  The
//! key material is the first 32 characters of the one SDK key containing
//! the postfix, hashed together with a per-version constant.
//!
//! * **v1**: payload is base64 with `-_*` in place of `+/=`.  Its first 8
//!   bytes are the seed, XOR-masked with the key; the rest is ciphertext.
//! * **v2**: payload is raw bytes.  Bytes 8..16 hold the masked seed; the
//!   mask is one of several values derived from the key digest, so every
//!   candidate is tried until one yields JSON.
//!
//! Both versions XOR each byte with the key (cycling over 32 bytes) and
//! with a keystream produced 8 bytes at a time by [`mix64`].  All of this
//! is pure: the same inputs always give the same plaintext.

use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use sha2::{Digest, Sha256};

use adscan_common::config::{CipherConstants, MixConstants};
use adscan_common::error::ScanError;

const KEY_PREFIX_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("malformed blob: {0}")]
    Malformed(&'static str),
    #[error("unsupported blob version {0:?}")]
    UnsupportedVersion(String),
    #[error("no SDK key contains postfix {0:?}")]
    NoKey(String),
    #[error("{count} SDK keys contain postfix {postfix:?}")]
    AmbiguousKey { postfix: String, count: usize },
    #[error("payload is not valid base64")]
    Base64,
    #[error("payload too short to hold a seed")]
    TooShort,
    #[error("plaintext is not UTF-8 text")]
    NotText,
    #[error("no seed candidate produced JSON text")]
    NoCandidate,
}

impl From<CipherError> for ScanError {
    fn from(e: CipherError) -> Self {
        ScanError::CryptoDecodeFailure(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

/// A blob split into its header fields.
#[derive(Debug, Clone)]
pub struct CipherBlob<'a> {
    pub version: Version,
    /// Hash of the constant the sender used; informational only.
    pub observed_sha1: &'a str,
    pub sdk_postfix: &'a str,
    /// Offset of the payload within the whole blob.
    pub payload_start: usize,
    raw: &'a [u8],
}

impl<'a> CipherBlob<'a> {
    pub fn payload(&self) -> &'a [u8] {
        &self.raw[self.payload_start..]
    }
}

/// Cheap check used to decide whether a body is worth decoding.
pub fn looks_like_blob(body: &[u8]) -> bool {
    (body.starts_with(b"1:") || body.starts_with(b"2:"))
        && body.iter().take(256).filter(|&&b| b == b':').count() >= 3
}

pub fn parse_blob(raw: &[u8]) -> Result<CipherBlob<'_>, CipherError> {
    let mut fields = Vec::with_capacity(3);
    let mut start = 0;
    for _ in 0..3 {
        let colon = raw[start..]
            .iter()
            .position(|&b| b == b':')
            .ok_or(CipherError::Malformed("fewer than four fields"))?;
        let field = std::str::from_utf8(&raw[start..start + colon])
            .map_err(|_| CipherError::Malformed("header is not text"))?;
        fields.push(field);
        start += colon + 1;
    }
    let version = match fields[0] {
        "1" => Version::V1,
        "2" => Version::V2,
        other => return Err(CipherError::UnsupportedVersion(other.to_string())),
    };
    Ok(CipherBlob {
        version,
        observed_sha1: fields[1],
        sdk_postfix: fields[2],
        payload_start: start,
        raw,
    })
}

/// 32-character key prefix of the single SDK key containing `postfix`.
pub fn resolve_key_prefix(postfix: &str, sdk_keys: &[String]) -> Result<String, CipherError> {
    let mut matching: Vec<&String> = sdk_keys.iter().filter(|k| k.contains(postfix)).collect();
    matching.sort();
    matching.dedup();
    match matching.as_slice() {
        [] => Err(CipherError::NoKey(postfix.to_string())),
        [key] => Ok(key.chars().take(KEY_PREFIX_LEN).collect()),
        many => Err(CipherError::AmbiguousKey {
            postfix: postfix.to_string(),
            count: many.len(),
        }),
    }
}

/// Decode a blob end to end.
pub fn decode(
    raw: &[u8],
    sdk_keys: &[String],
    constants: &CipherConstants,
) -> Result<String, CipherError> {
    let blob = parse_blob(raw)?;
    let prefix = resolve_key_prefix(blob.sdk_postfix, sdk_keys)?;
    match blob.version {
        Version::V1 => decode_v1(blob.payload(), &prefix, constants),
        Version::V2 => decode_v2(&blob, &prefix, constants),
    }
}

// ── version 1 ────────────────────────────────────────────────────────────

pub fn decode_v1(
    payload: &[u8],
    key_prefix: &str,
    constants: &CipherConstants,
) -> Result<String, CipherError> {
    let text = std::str::from_utf8(payload).map_err(|_| CipherError::Base64)?;
    let standard: String = text
        .trim()
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            '*' => '=',
            other => other,
        })
        .collect();
    let data = BASE64.decode(standard).map_err(|_| CipherError::Base64)?;
    if data.len() <= 16 {
        return Err(CipherError::TooShort);
    }

    let key = key_digest(&constants.const_a, key_prefix);
    let mut seed_bytes = [0u8; 8];
    for (i, b) in seed_bytes.iter_mut().enumerate() {
        *b = data[i] ^ key[i];
    }
    let seed = u64::from_le_bytes(seed_bytes);
    let plain = apply_keystream(&data[8..], seed, &key, constants.v1_mix);
    String::from_utf8(inflate(&plain)).map_err(|_| CipherError::NotText)
}

// ── version 2 ────────────────────────────────────────────────────────────

pub fn decode_v2(
    blob: &CipherBlob<'_>,
    key_prefix: &str,
    constants: &CipherConstants,
) -> Result<String, CipherError> {
    let payload = blob.payload();
    if payload.len() <= 16 {
        return Err(CipherError::TooShort);
    }
    let seed_enc = le_u64(&payload[8..16]);
    let ciphertext = &payload[16..];
    let digest = key_digest(&constants.const_b, key_prefix);

    seed_candidates(&digest)
        .into_iter()
        .find_map(|candidate| {
            let plain = apply_keystream(ciphertext, seed_enc ^ candidate, &digest, constants.v2_mix);
            json_text(inflate(&plain))
        })
        .ok_or(CipherError::NoCandidate)
}

/// Seed masks in trial order: each 8-byte digest chunk little- then
/// big-endian, then the XOR of all chunks in both byte orders.
fn seed_candidates(digest: &[u8; 32]) -> Vec<u64> {
    let mut out = Vec::with_capacity(10);
    for chunk in digest.chunks_exact(8) {
        out.push(le_u64(chunk));
        out.push(be_u64(chunk));
    }
    out.push(digest.chunks_exact(8).map(le_u64).fold(0, |a, b| a ^ b));
    out.push(digest.chunks_exact(8).map(be_u64).fold(0, |a, b| a ^ b));
    out
}

// ── shared primitives ────────────────────────────────────────────────────

fn key_digest(constant: &[u8], key_prefix: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(constant);
    hasher.update(key_prefix.as_bytes());
    hasher.finalize().into()
}

/// 64-bit mixing step.  Shifts are logical and multiplications wrap, which
/// reproduces two's-complement `long` arithmetic bit for bit.
pub fn mix64(seed: u64, offset: u64, mix: MixConstants) -> u64 {
    let mut x = seed.wrapping_add(offset);
    x = (x ^ (x >> 33)).wrapping_mul(mix.c1 as u64);
    x = (x ^ (x >> 29)).wrapping_mul(mix.c2 as u64);
    x ^ (x >> 32)
}

fn apply_keystream(data: &[u8], seed: u64, key: &[u8; 32], mix: MixConstants) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for (block_idx, block) in data.chunks(8).enumerate() {
        let offset = block_idx * 8;
        let stream = mix64(seed, offset as u64, mix).to_le_bytes();
        for (j, &c) in block.iter().enumerate() {
            out.push(c ^ key[(offset + j) % 32] ^ stream[j]);
        }
    }
    out
}

/// Output of the first of gzip, zlib and raw deflate that accepts `data`,
/// or `data` itself when none does.
fn inflate(data: &[u8]) -> Vec<u8> {
    fn read_all(mut r: impl Read) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).ok().map(|_| out)
    }
    read_all(GzDecoder::new(data))
        .or_else(|| read_all(ZlibDecoder::new(data)))
        .or_else(|| read_all(DeflateDecoder::new(data)))
        .unwrap_or_else(|| data.to_vec())
}

/// Trimmed text when it opens a JSON object or array.
fn json_text(bytes: Vec<u8>) -> Option<String> {
    let text = String::from_utf8(bytes).ok()?;
    let trimmed = text.trim();
    (trimmed.starts_with('{') || trimmed.starts_with('[')).then(|| trimmed.to_string())
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIX: MixConstants = MixConstants {
        c1: -4658895280553007687,
        c2: -7723592293110705685,
    };

    fn constants() -> CipherConstants {
        CipherConstants {
            v1_mix: MIX,
            v2_mix: MIX,
            const_a: b"adscan-test-constant-a".to_vec(),
            const_b: b"adscan-test-constant-b".to_vec(),
        }
    }

    fn keys() -> Vec<String> {
        vec![
            "0123456789abcdef0123456789abcdefpfx9".to_string(),
            "ffffeeeeddddccccbbbbaaaa99998888zzzz".to_string(),
        ]
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    const V1_BLOB: &str = "1:b73e93cbdd298f79562956bc81a00052e14001bf:pfx9:\
        mwx3bg28oFts8oAJhka8-v1BLXmUu6gt9mwLD89vSckWdCx1tkfEkX2W7c4dPyWk26XU8GFQushxegf0_\
        -2-VPlLzAgxpzAVBUKnFYQJgtwTqXuJaLGXgScSrO-dDYNkTti8_ScB_Q**";

    const V2_HEADER: &str = "2:05ae51dc91717ff848ea45e80a46268abd4235ca:pfx9:";
    const V2_PAYLOAD_HEX: &str = "a0a1a2a3a4a5a6a7d084c50d312bbc1dcef50b267eeac2f110415ec8\
        1089b5eb29925d332796103e8aa5f801a84fcbd6d2fceef227406bc88f";

    #[test]
    fn test_mix64_wraps() {
        assert_eq!(mix64(0, 0, MIX), 0);
        assert_eq!(mix64(1, 0, MIX), 0x08ae_d039_0bd5_bae2);
        // seed + offset overflows to 7
        assert_eq!(mix64(u64::MAX, 8, MIX), 0x6b0f_1b05_0e05_e6de);
    }

    #[test]
    fn test_decode_v1_fixture() {
        let text = decode(V1_BLOB.as_bytes(), &keys(), &constants()).unwrap();
        assert_eq!(
            text,
            r#"{"ads":[{"package":"com.example.advertiser","click":"https://app.adjust.com/xyz"}]}"#
        );
    }

    /// Encrypt `plain` the way a v1 SDK would, gzip included.
    fn v1_blob(plain: &str, seed: u64) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(plain.as_bytes()).unwrap();
        let compressed = gz.finish().unwrap();

        let key = key_digest(&constants().const_a, &keys()[0][..32]);
        let mut data: Vec<u8> = seed.to_le_bytes().iter().zip(key.iter()).map(|(s, k)| s ^ k).collect();
        data.extend(apply_keystream(&compressed, seed, &key, MIX));
        let encoded: String = BASE64
            .encode(data)
            .chars()
            .map(|c| match c {
                '+' => '-',
                '/' => '_',
                '=' => '*',
                other => other,
            })
            .collect();
        format!("1:0000:pfx9:{encoded}").into_bytes()
    }

    #[test]
    fn test_decode_v1_keeps_non_json_text_verbatim() {
        let plain = "  click=https%3A%2F%2Fapp.adjust.com%2Fq&pkg=com.adv.v1\n";
        let blob = v1_blob(plain, 0x1234_5678_9abc_def0);
        assert_eq!(decode(&blob, &keys(), &constants()).unwrap(), plain);
    }

    #[test]
    fn test_decode_v2_fixture_tries_candidates() {
        let mut blob = V2_HEADER.as_bytes().to_vec();
        blob.extend(hex(V2_PAYLOAD_HEX));
        let text = decode(&blob, &keys(), &constants()).unwrap();
        assert_eq!(text, r#"[{"bundle":"com.example.v2advertiser"}]"#);
    }

    #[test]
    fn test_wrong_constants_fail_softly() {
        let mut c = constants();
        c.const_a = b"wrong".to_vec();
        assert!(matches!(
            decode(V1_BLOB.as_bytes(), &keys(), &c),
            Err(CipherError::NotText)
        ));
        let err: ScanError = CipherError::NotText.into();
        assert!(matches!(err, ScanError::CryptoDecodeFailure(_)));
    }

    #[test]
    fn test_key_prefix_resolution() {
        assert_eq!(
            resolve_key_prefix("pfx9", &keys()).unwrap(),
            "0123456789abcdef0123456789abcdef"
        );
        assert!(matches!(resolve_key_prefix("nope", &keys()), Err(CipherError::NoKey(_))));
        let mut dup = keys();
        dup.push("aaaapfx9".to_string());
        assert!(matches!(
            resolve_key_prefix("pfx9", &dup),
            Err(CipherError::AmbiguousKey { count: 2, .. })
        ));
    }

    #[test]
    fn test_blob_header_errors() {
        assert!(matches!(parse_blob(b"3:a:b:c"), Err(CipherError::UnsupportedVersion(_))));
        assert!(matches!(parse_blob(b"1:a:b"), Err(CipherError::Malformed(_))));
        assert!(matches!(
            decode(b"1:x:pfx9:AAAA", &keys(), &constants()),
            Err(CipherError::TooShort)
        ));
        assert!(looks_like_blob(V1_BLOB.as_bytes()));
        assert!(!looks_like_blob(b"{\"ads\":[]}"));
    }
}
