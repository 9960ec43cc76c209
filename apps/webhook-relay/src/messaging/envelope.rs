//! Wire form of a relayed webhook.
//!
//! ```json
//! {"method":"POST","host":"hooks.example.com","path":"/orders/42",
//!  "headers":{"X-Test":["v"]},"body":"{\"id\":42}"}
//! ```
//!
//! Text bodies travel verbatim. Bodies that are not valid UTF-8 are base64
//! encoded and tagged with `"body_encoding":"base64"` so the bytes survive
//! the trip. Header values get the same treatment as a group: if any value
//! holds non-UTF-8 bytes, every value is base64 encoded and the envelope
//! carries `"headers_encoding":"base64"`.

use std::collections::BTreeMap;

use axum::http::{
    header::HOST, request::Parts, HeaderMap, HeaderName, HeaderValue, Method, Request, Uri,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

pub const ENVELOPE_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub method: String,
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<Encoding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers_encoding: Option<Encoding>,
}

impl Envelope {
    /// Captures an inbound request. `Host` moves into [`Envelope::host`]
    /// (falling back to the URI authority); every other header keeps all of
    /// its values in arrival order.
    pub fn from_parts(parts: &Parts, body: &[u8]) -> Self {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.as_str().to_string()))
            .unwrap_or_default();

        let (headers, headers_encoding) = collect_headers(&parts.headers);
        let mut envelope = Self {
            method: parts.method.as_str().to_string(),
            host,
            path: parts.uri.path().to_string(),
            headers,
            body: String::new(),
            body_encoding: None,
            headers_encoding,
        };
        envelope.set_body(body);
        envelope
    }

    pub fn set_body(&mut self, body: &[u8]) {
        match std::str::from_utf8(body) {
            Ok(text) => {
                self.body = text.to_string();
                self.body_encoding = None;
            }
            Err(_) => {
                self.body = STANDARD.encode(body);
                self.body_encoding = Some(Encoding::Base64);
            }
        }
    }

    pub fn body_bytes(&self) -> RelayResult<Bytes> {
        match self.body_encoding {
            None => Ok(Bytes::from(self.body.clone())),
            Some(Encoding::Base64) => STANDARD
                .decode(&self.body)
                .map(Bytes::from)
                .map_err(|err| RelayError::Decode(format!("invalid base64 body: {err}"))),
        }
    }

    pub fn routing_key(&self) -> String {
        routing_key(&self.path)
    }

    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| RelayError::Serialization(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> RelayResult<Self> {
        serde_json::from_slice(bytes).map_err(|err| RelayError::Decode(err.to_string()))
    }

    /// Rebuilds the request against `uri` with the original method, headers
    /// and body. Relay metadata and host handling are left to the caller.
    pub fn to_http_request(&self, uri: Uri) -> RelayResult<Request<Bytes>> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|_| RelayError::Decode(format!("invalid method '{}'", self.method)))?;

        let mut request = Request::new(self.body_bytes()?);
        *request.method_mut() = method;
        *request.uri_mut() = uri;

        let headers = request.headers_mut();
        for (name, values) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| RelayError::Decode(format!("invalid header name '{name}'")))?;
            for value in values {
                let bytes = match self.headers_encoding {
                    None => value.as_bytes().to_vec(),
                    Some(Encoding::Base64) => STANDARD.decode(value).map_err(|err| {
                        RelayError::Decode(format!("invalid base64 value for header '{name}': {err}"))
                    })?,
                };
                let value = HeaderValue::from_bytes(&bytes).map_err(|_| {
                    RelayError::Decode(format!("invalid value for header '{name}'"))
                })?;
                headers.append(header.clone(), value);
            }
        }
        Ok(request)
    }
}

/// `/a/b/c` becomes `a.b.c`; `/` and the empty path become the empty key.
pub fn routing_key(path: &str) -> String {
    path.replace('/', ".").trim_matches('.').to_string()
}

fn collect_headers(headers: &HeaderMap) -> (BTreeMap<String, Vec<String>>, Option<Encoding>) {
    let all_text = headers
        .iter()
        .filter(|(name, _)| *name != HOST)
        .all(|(_, value)| std::str::from_utf8(value.as_bytes()).is_ok());
    let mut collected: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if name == HOST {
            continue;
        }
        let value = if all_text {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        } else {
            STANDARD.encode(value.as_bytes())
        };
        collected
            .entry(canonical_header_name(name.as_str()))
            .or_default()
            .push(value);
    }
    (collected, (!all_text).then_some(Encoding::Base64))
}

/// MIME canonical form: `x-github-event` becomes `X-Github-Event`. Names
/// holding anything other than token characters are returned unchanged.
pub fn canonical_header_name(name: &str) -> String {
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
    {
        return name.to_string();
    }
    let mut upper = true;
    name.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(body: &'static [u8]) -> (Parts, Bytes) {
        let request = Request::builder()
            .method("POST")
            .uri("/orders/42?source=test")
            .header("host", "hooks.example.com")
            .header("x-test", "v")
            .header("x-multi", "one")
            .header("x-multi", "two")
            .body(Bytes::from_static(body))
            .expect("request");
        let (parts, body) = request.into_parts();
        (parts, body)
    }

    #[test_timeout::timeout]
    fn routing_keys_follow_the_path() {
        assert_eq!(routing_key("/a/b/c"), "a.b.c");
        assert_eq!(routing_key("/"), "");
        assert_eq!(routing_key(""), "");
        assert_eq!(routing_key("a/b"), "a.b");
        assert_eq!(routing_key("/orders/42/"), "orders.42");
    }

    #[test_timeout::timeout]
    fn captures_request_fields() {
        let (parts, body) = inbound(b"{\"id\":42}");
        let envelope = Envelope::from_parts(&parts, &body);

        assert_eq!(envelope.method, "POST");
        assert_eq!(envelope.host, "hooks.example.com");
        assert_eq!(envelope.path, "/orders/42");
        assert_eq!(envelope.headers["X-Test"], vec!["v"]);
        assert_eq!(envelope.headers["X-Multi"], vec!["one", "two"]);
        assert!(!envelope.headers.contains_key("Host"));
        assert_eq!(envelope.body, "{\"id\":42}");
        assert_eq!(envelope.routing_key(), "orders.42");
    }

    #[test_timeout::timeout]
    fn host_falls_back_to_uri_authority() {
        let request = Request::builder()
            .uri("http://fallback.example.com/x")
            .body(())
            .expect("request");
        let (parts, _) = request.into_parts();
        assert_eq!(Envelope::from_parts(&parts, b"").host, "fallback.example.com");
    }

    #[test_timeout::timeout]
    fn wire_format_matches_plain_json_shape() {
        let (parts, body) = inbound(b"hello");
        let encoded = Envelope::from_parts(&parts, &body).encode().expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&encoded).expect("json");

        assert_eq!(value["method"], "POST");
        assert_eq!(value["path"], "/orders/42");
        assert_eq!(value["headers"]["X-Multi"], serde_json::json!(["one", "two"]));
        assert_eq!(value["body"], "hello");
        assert!(value.get("body_encoding").is_none());
    }

    #[test_timeout::timeout]
    fn decodes_messages_without_optional_fields() {
        let raw = br#"{"method":"GET","host":"h","path":"/p","headers":{"A":["1"]},"body":""}"#;
        let envelope = Envelope::decode(raw).expect("decode");
        assert_eq!(envelope.method, "GET");
        assert_eq!(envelope.body_encoding, None);
        assert!(Envelope::decode(b"not json").is_err());
    }

    #[test_timeout::timeout]
    fn request_round_trip_preserves_method_path_headers_and_body() {
        let (parts, body) = inbound(b"{\"id\":42}");
        let decoded = Envelope::decode(
            &Envelope::from_parts(&parts, &body).encode().expect("encode"),
        )
        .expect("decode");

        let rebuilt = decoded
            .to_http_request(Uri::from_static("http://dest.internal/orders/42"))
            .expect("rebuild");

        assert_eq!(rebuilt.method(), &parts.method);
        assert_eq!(rebuilt.uri().path(), parts.uri.path());
        let mut expected = parts.headers.clone();
        expected.remove(HOST);
        assert_eq!(rebuilt.headers(), &expected);
        assert_eq!(rebuilt.body(), &body);
    }

    #[test_timeout::timeout]
    fn binary_bodies_survive_the_trip() {
        let (parts, _) = inbound(b"");
        let binary: &[u8] = &[0xff, 0x00, 0xfe, 0x80, b'a'];
        let envelope = Envelope::from_parts(&parts, binary);
        assert_eq!(envelope.body_encoding, Some(Encoding::Base64));

        let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.body_bytes().expect("bytes").as_ref(), binary);
    }

    #[test_timeout::timeout]
    fn opaque_header_bytes_survive_the_trip() {
        let mut request = Request::builder()
            .method("POST")
            .uri("/raw")
            .header("x-test", "café")
            .body(Bytes::new())
            .expect("request");
        request.headers_mut().append(
            "x-raw",
            HeaderValue::from_bytes(&[b'a', 0xE9]).expect("obs-text value"),
        );
        let (parts, _) = request.into_parts();

        let envelope = Envelope::from_parts(&parts, b"");
        assert_eq!(envelope.headers_encoding, Some(Encoding::Base64));
        let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
        let rebuilt = decoded
            .to_http_request(Uri::from_static("http://dest.internal/raw"))
            .expect("rebuild");

        assert_eq!(rebuilt.headers()["x-raw"].as_bytes(), &[b'a', 0xE9]);
        assert_eq!(rebuilt.headers()["x-test"].as_bytes(), "café".as_bytes());
        assert_eq!(rebuilt.headers(), &parts.headers);
    }

    #[test_timeout::timeout]
    fn text_headers_stay_readable_on_the_wire() {
        let (parts, body) = inbound(b"");
        let envelope = Envelope::from_parts(&parts, &body);
        assert_eq!(envelope.headers_encoding, None);
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.encode().expect("encode")).expect("json");
        assert_eq!(value["headers"]["X-Multi"], serde_json::json!(["one", "two"]));
        assert!(value.get("headers_encoding").is_none());
    }

    #[test_timeout::timeout]
    fn canonicalises_header_names() {
        assert_eq!(canonical_header_name("x-github-event"), "X-Github-Event");
        assert_eq!(canonical_header_name("CONTENT-TYPE"), "Content-Type");
        assert_eq!(canonical_header_name("weird name"), "weird name");
    }

    #[test_timeout::timeout]
    fn rejects_invalid_method_on_rebuild() {
        let envelope = Envelope {
            method: "BAD METHOD".into(),
            host: String::new(),
            path: "/".into(),
            headers: BTreeMap::new(),
            body: String::new(),
            body_encoding: None,
            headers_encoding: None,
        };
        assert!(matches!(
            envelope.to_http_request(Uri::from_static("http://dest/")),
            Err(RelayError::Decode(_))
        ));
    }
}
