//! Resource locator codec
//!
//! Packs the identity of a chat message into an opaque, URL-path-safe token
//! and back. Tokens are deterministic: the same identity always yields the
//! same token, so a link stays stable for as long as the message exists.
//!
//! Layout: `base64url(nonce || ciphertext || tag)` where the ciphertext is
//! ChaCha20-Poly1305 over `chat|message|group|channel`. The nonce is derived
//! from an HMAC of the plaintext instead of being random.

use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::{digest, hmac};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

const FIELD_DELIMITER: char = '|';
const FIELD_COUNT: usize = 4;
const TAG_LEN: usize = 16;

const ENC_KEY_CONTEXT: &[u8] = b"tgfilestream.locator.enc";
const MAC_KEY_CONTEXT: &[u8] = b"tgfilestream.locator.mac";

/// Identity of a chat message carrying a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub chat_id: i64,
    pub message_id: i64,
    pub is_group: bool,
    pub is_channel: bool,
}

impl ResourceIdentity {
    /// Identity of a message in a private chat
    pub fn private(chat_id: i64, message_id: i64) -> Self {
        ResourceIdentity {
            chat_id,
            message_id,
            is_group: false,
            is_channel: false,
        }
    }

    fn to_plaintext(self) -> String {
        format!(
            "{}{d}{}{d}{}{d}{}",
            self.chat_id,
            self.message_id,
            u8::from(self.is_group),
            u8::from(self.is_channel),
            d = FIELD_DELIMITER
        )
    }

    fn from_plaintext(plain: &str) -> std::result::Result<Self, DecodeError> {
        let fields: Vec<&str> = plain.split(FIELD_DELIMITER).collect();
        if fields.len() != FIELD_COUNT {
            return Err(DecodeError::FieldCount(fields.len()));
        }

        Ok(ResourceIdentity {
            chat_id: parse_int("chat_id", fields[0])?,
            message_id: parse_int("message_id", fields[1])?,
            is_group: parse_flag("is_group", fields[2])?,
            is_channel: parse_flag("is_channel", fields[3])?,
        })
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chat {} message {} (group={}, channel={})",
            self.chat_id, self.message_id, self.is_group, self.is_channel
        )
    }
}

/// Why a token failed to decode
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("token is not valid base64url")]
    Base64,

    #[error("token is too short")]
    TooShort,

    /// Authentication tag mismatch: wrong key or modified token
    #[error("token was tampered with or sealed under another key")]
    Tampered,

    #[error("token payload is not UTF-8")]
    NotUtf8,

    #[error("expected 4 fields, found {0}")]
    FieldCount(usize),

    #[error("field {field} has invalid value {value:?}")]
    InvalidField { field: &'static str, value: String },
}

fn parse_int(field: &'static str, value: &str) -> std::result::Result<i64, DecodeError> {
    value.parse::<i64>().map_err(|_| DecodeError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn parse_flag(field: &'static str, value: &str) -> std::result::Result<bool, DecodeError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(DecodeError::InvalidField {
            field,
            value: value.to_string(),
        }),
    }
}

/// Encodes and decodes resource tokens under a pre-shared secret
pub struct LocatorCodec {
    cipher: LessSafeKey,
    nonce_key: hmac::Key,
}

impl LocatorCodec {
    /// Create a codec from the shared secret
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::InvalidConfig("Token secret must not be empty".to_string()));
        }

        let enc_key = derive_subkey(ENC_KEY_CONTEXT, secret);
        let mac_key = derive_subkey(MAC_KEY_CONTEXT, secret);

        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &enc_key[..])
            .map_err(|_| Error::Internal("Failed to initialise token cipher".to_string()))?;

        Ok(LocatorCodec {
            cipher: LessSafeKey::new(unbound),
            nonce_key: hmac::Key::new(hmac::HMAC_SHA256, &mac_key[..]),
        })
    }

    /// Encode an identity into a URL-safe token
    pub fn encode(&self, identity: &ResourceIdentity) -> Result<String> {
        self.seal(identity.to_plaintext().as_bytes())
    }

    /// Decode a token back into an identity
    pub fn decode(&self, token: &str) -> std::result::Result<ResourceIdentity, DecodeError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim_end_matches('='))
            .map_err(|_| DecodeError::Base64)?;

        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(DecodeError::TooShort);
        }

        let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| DecodeError::TooShort)?;

        let mut in_out = sealed.to_vec();
        let plain = self
            .cipher
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| DecodeError::Tampered)?;

        let plain = std::str::from_utf8(plain).map_err(|_| DecodeError::NotUtf8)?;
        ResourceIdentity::from_plaintext(plain)
    }

    fn seal(&self, plain: &[u8]) -> Result<String> {
        let tag = hmac::sign(&self.nonce_key, plain);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&tag.as_ref()[..NONCE_LEN]);

        let mut in_out = plain.to_vec();
        self.cipher
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| Error::Internal("Failed to seal resource token".to_string()))?;

        let mut token = Vec::with_capacity(NONCE_LEN + in_out.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&in_out);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }
}

fn derive_subkey(context: &[u8], secret: &str) -> Zeroizing<[u8; 32]> {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(context);
    ctx.update(secret.as_bytes());

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(ctx.finish().as_ref());
    key
}
