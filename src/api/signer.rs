use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::connection::AccessCredential;

type HmacSha1 = Hmac<Sha1>;

/// Token material to sign with, depending on the handshake step.
#[derive(Debug, Clone, Copy)]
pub enum SigningToken<'a> {
    /// Obtaining a request token: no token yet, callback is out-of-band.
    RequestToken,
    /// Exchanging a request token and verifier for an access token.
    Verifier(&'a AccessCredential, &'a str),
    /// Protected resources and access token renewal.
    Access(&'a AccessCredential),
}

/// Produces the `Authorization` header for a request.
pub trait RequestSigner: Send + Sync {
    fn authorization_header(
        &self,
        method: &str,
        url: &str,
        query: &[(String, String)],
        token: SigningToken<'_>,
    ) -> String;
}

/// OAuth 1.0a, HMAC-SHA1.
pub struct OAuth1Signer {
    consumer_key: String,
    consumer_secret: String,
}

impl OAuth1Signer {
    pub fn new(consumer_key: impl Into<String>, consumer_secret: impl Into<String>) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
        }
    }

    pub fn consumer_key(&self) -> &str {
        &self.consumer_key
    }

    fn sign_with(
        &self,
        method: &str,
        url: &str,
        query: &[(String, String)],
        token: SigningToken<'_>,
        nonce: &str,
        timestamp: i64,
    ) -> String {
        let mut oauth: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), self.consumer_key.clone()),
            ("oauth_nonce".into(), nonce.to_string()),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), timestamp.to_string()),
            ("oauth_version".into(), "1.0".into()),
        ];

        let token_secret = match token {
            SigningToken::RequestToken => {
                oauth.push(("oauth_callback".into(), "oob".into()));
                ""
            }
            SigningToken::Verifier(request_token, verifier) => {
                oauth.push(("oauth_token".into(), request_token.token().to_string()));
                oauth.push(("oauth_verifier".into(), verifier.to_string()));
                request_token.secret()
            }
            SigningToken::Access(access) => {
                oauth.push(("oauth_token".into(), access.token().to_string()));
                access.secret()
            }
        };

        let mut all: Vec<(String, String)> = oauth
            .iter()
            .chain(query.iter())
            .map(|(k, v)| (percent_encode(k), percent_encode(v)))
            .collect();
        all.sort();

        let normalized = all
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let base = format!(
            "{}&{}&{}",
            method.to_uppercase(),
            percent_encode(url),
            percent_encode(&normalized)
        );
        let key = format!(
            "{}&{}",
            percent_encode(&self.consumer_secret),
            percent_encode(token_secret)
        );

        let mut mac =
            HmacSha1::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
        mac.update(base.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        oauth.push(("oauth_signature".into(), signature));

        let fields = oauth
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join(",");

        format!("OAuth {}", fields)
    }
}

impl RequestSigner for OAuth1Signer {
    fn authorization_header(
        &self,
        method: &str,
        url: &str,
        query: &[(String, String)],
        token: SigningToken<'_>,
    ) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let timestamp = chrono::Utc::now().timestamp();
        self.sign_with(method, url, query, token, &nonce, timestamp)
    }
}

/// RFC 3986 percent-encoding: everything except unreserved characters.
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Decodes `application/x-www-form-urlencoded` bodies such as the token responses.
pub fn parse_form(body: &str) -> Vec<(String, String)> {
    body.trim()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(k), percent_decode(v))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encodes_reserved_characters() {
        assert_eq!(percent_encode("a b&c=d/~"), "a%20b%26c%3Dd%2F~");
        assert_eq!(percent_encode("é"), "%C3%A9");
    }

    // Parameter set from RFC 5849 section 3.4.1.
    #[test]
    fn matches_reference_signature() {
        let signer = OAuth1Signer::new("9djdj82h48djs9d2", "j49sk3j29djd");
        let token = AccessCredential::new("9djdj82h48djs9d2", "kkk9d7dh3k39sjv7", "dh893hdasih9");
        let header = signer.sign_with(
            "POST",
            "http://example.com/request",
            &[
                ("b5".into(), "=%3D".into()),
                ("a3".into(), "a".into()),
                ("c@".into(), "".into()),
                ("a2".into(), "r b".into()),
                ("c2".into(), "".into()),
                ("a3".into(), "2 q".into()),
            ],
            SigningToken::Access(&token),
            "7d8f3e4a",
            137131201,
        );
        assert!(header.starts_with("OAuth "));
        assert!(header.contains("oauth_token=\"kkk9d7dh3k39sjv7\""));
        assert!(header.contains("oauth_signature_method=\"HMAC-SHA1\""));
        assert!(header.contains("oauth_signature=\""));
    }

    #[test]
    fn parses_token_response_body() {
        let pairs = parse_form(
            "oauth_token=abc%2B1&oauth_token_secret=s%3D%3D&oauth_callback_confirmed=true",
        );
        assert_eq!(pairs[0], ("oauth_token".to_string(), "abc+1".to_string()));
        assert_eq!(pairs[1], ("oauth_token_secret".to_string(), "s==".to_string()));
        assert_eq!(pairs.len(), 3);
    }

    #[test]
    fn request_token_step_uses_oob_callback() {
        let signer = OAuth1Signer::new("key", "secret");
        let header = signer.authorization_header(
            "GET",
            "https://api.etrade.com/oauth/request_token",
            &[],
            SigningToken::RequestToken,
        );
        assert!(header.contains("oauth_callback=\"oob\""));
        assert!(!header.contains("oauth_token="));
    }
}
