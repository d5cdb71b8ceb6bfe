//! Transport form of a proxied request
//!
//! A [`ProxyRequest`] is what the client ships to the proxy and what the proxy
//! hashes and forwards. The wire encoding is a small versioned binary framing,
//! independent of any HTTP library's request type:
//!
//! ```text
//! magic    "HPRQ"
//! version  u8 (= 1)
//! method   u16 len + bytes
//! url      u32 len + bytes
//! headers  u32 count, then per header: u16 name len + bytes, u32 value len + bytes
//! body     u32 len + bytes
//! ```
//!
//! All integers are big-endian. Decoding rejects trailing bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Leading bytes of every encoded request
pub const WIRE_MAGIC: &[u8; 4] = b"HPRQ";

/// Current wire format version
pub const WIRE_VERSION: u8 = 1;

/// A request to be executed against the origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    /// HTTP method (`GET`, `HEAD`, ...)
    pub method: String,
    /// Absolute target URL
    pub url: String,
    /// Header list in the order the client supplied it
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Bytes,
}

impl ProxyRequest {
    /// Create a request with no headers and an empty body
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Shorthand for a `GET` request
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// Append a header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether the method is one the proxy is willing to cache and replay
    #[must_use]
    pub fn is_idempotent_read(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET") || self.method.eq_ignore_ascii_case("HEAD")
    }

    /// Encode into the wire format
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            16 + self.method.len() + self.url.len() + self.body.len() + self.headers.len() * 32,
        );
        buf.put_slice(WIRE_MAGIC);
        buf.put_u8(WIRE_VERSION);
        put_short(&mut buf, "method", self.method.as_bytes())?;
        put_long(&mut buf, "url", self.url.as_bytes())?;
        buf.put_u32(len_u32("header count", self.headers.len())?);
        for (name, value) in &self.headers {
            put_short(&mut buf, "header name", name.as_bytes())?;
            put_long(&mut buf, "header value", value.as_bytes())?;
        }
        put_long(&mut buf, "body", &self.body)?;
        Ok(buf.freeze())
    }

    /// Decode from the wire format
    pub fn decode(mut data: Bytes) -> Result<Self> {
        let magic = take(&mut data, WIRE_MAGIC.len(), "magic")?;
        if &magic[..] != WIRE_MAGIC {
            return Err(Error::Encoding("not an hproxy request (bad magic)".to_string()));
        }
        let version = take(&mut data, 1, "version")?[0];
        if version != WIRE_VERSION {
            return Err(Error::Encoding(format!(
                "unsupported request encoding version {version}"
            )));
        }

        let method = utf8(take_short(&mut data, "method")?, "method")?;
        let url = utf8(take_long(&mut data, "url")?, "url")?;

        let count = take_u32(&mut data, "header count")? as usize;
        // Each header needs at least six length bytes; reject absurd counts up front.
        if count > data.remaining() / 6 {
            return Err(Error::Encoding(format!("header count {count} exceeds payload")));
        }
        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            let name = utf8(take_short(&mut data, "header name")?, "header name")?;
            let value = String::from_utf8_lossy(&take_long(&mut data, "header value")?).into_owned();
            headers.push((name, value));
        }

        let body = take_long(&mut data, "body")?;
        if data.has_remaining() {
            return Err(Error::Encoding(format!(
                "{} trailing bytes after request",
                data.remaining()
            )));
        }

        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }
}

fn len_u32(field: &str, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Encoding(format!("{field} too long ({len} bytes)")))
}

fn put_short(buf: &mut BytesMut, field: &str, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| Error::Encoding(format!("{field} too long ({} bytes)", bytes.len())))?;
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

fn put_long(buf: &mut BytesMut, field: &str, bytes: &[u8]) -> Result<()> {
    buf.put_u32(len_u32(field, bytes.len())?);
    buf.put_slice(bytes);
    Ok(())
}

fn take(data: &mut Bytes, len: usize, field: &str) -> Result<Bytes> {
    if data.remaining() < len {
        return Err(Error::Encoding(format!(
            "truncated {field}: need {len} bytes, have {}",
            data.remaining()
        )));
    }
    Ok(data.split_to(len))
}

fn take_u32(data: &mut Bytes, field: &str) -> Result<u32> {
    let raw = take(data, 4, field)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn take_short(data: &mut Bytes, field: &str) -> Result<Bytes> {
    let raw = take(data, 2, field)?;
    let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    take(data, len, field)
}

fn take_long(data: &mut Bytes, field: &str) -> Result<Bytes> {
    let len = take_u32(data, field)? as usize;
    take(data, len, field)
}

fn utf8(bytes: Bytes, field: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Encoding(format!("{field} is not valid UTF-8")))
}
