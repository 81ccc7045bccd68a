use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("expected 3 fields in serialized credential, found {0}")]
    FieldCount(usize),
    #[error("credential field {index} is not valid base64: {message}")]
    Encoding { index: usize, message: String },
    #[error("credential field {0} is not valid UTF-8")]
    Utf8(usize),
}

/// OAuth token triple: the consumer key it was issued to, the token and its secret.
///
/// Serialized as three URL-safe base64 fields joined by `:` so any byte can
/// appear in the token itself.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredential {
    consumer_key: String,
    token: String,
    secret: String,
}

impl AccessCredential {
    pub fn new(
        consumer_key: impl Into<String>,
        token: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            token: token.into(),
            secret: secret.into(),
        }
    }

    pub fn consumer_key(&self) -> &str {
        &self.consumer_key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn serialize(&self) -> String {
        self.to_string()
    }

    pub fn deserialize(raw: &str) -> Result<Self, CredentialError> {
        raw.parse()
    }
}

impl fmt::Display for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            URL_SAFE_NO_PAD.encode(&self.consumer_key),
            URL_SAFE_NO_PAD.encode(&self.token),
            URL_SAFE_NO_PAD.encode(&self.secret)
        )
    }
}

impl FromStr for AccessCredential {
    type Err = CredentialError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = raw.trim().split(':').collect();
        if fields.len() != 3 {
            return Err(CredentialError::FieldCount(fields.len()));
        }

        let mut decoded = Vec::with_capacity(3);
        for (index, field) in fields.iter().enumerate() {
            let bytes = URL_SAFE_NO_PAD
                .decode(field)
                .map_err(|e| CredentialError::Encoding {
                    index,
                    message: e.to_string(),
                })?;
            decoded.push(String::from_utf8(bytes).map_err(|_| CredentialError::Utf8(index))?);
        }

        let secret = decoded.pop().unwrap_or_default();
        let token = decoded.pop().unwrap_or_default();
        let consumer_key = decoded.pop().unwrap_or_default();

        Ok(Self {
            consumer_key,
            token,
            secret,
        })
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredential")
            .field("consumer_key", &self.consumer_key)
            .field("token", &"[REDACTED]")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
