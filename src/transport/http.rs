//! Local HTTP transport
//!
//! Devices expose their RPC endpoint as `POST http://{host}/config`. The
//! embedded server is flaky in two specific ways this module works around:
//!
//! * it sometimes stalls on connect for no reason, so each call retries with
//!   a doubling per-attempt timeout up to a cap;
//! * it has a hard output-buffer limit and truncates large replies mid-JSON,
//!   so a decode failure near the end of the body is treated as truncation
//!   and, for a batched `Appliance.Control.Multiple` reply, salvaged by
//!   trimming the last incomplete sub-message from the array.
//!
//! Newer firmwares require the body AES-CBC encrypted (zero IV, base64) with
//! a key derived from the device identity; [`HttpTransport::enable_encryption`]
//! switches a client over once the ability is known.

use std::sync::Mutex;
use std::time::Duration;

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::message::{self, encryption_key, DeviceKey, Header, Message};
use crate::protocol::{Method, ProtocolError, MANUFACTURER};

use super::TransportError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const ZERO_IV: &[u8; 16] = b"0000000000000000";
const TOTAL_TIMEOUT: Duration = Duration::from_secs(10);
const FIRST_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// A decoded HTTP reply plus the bookkeeping the session's adaptive response
/// size estimate feeds on.
#[derive(Debug)]
pub struct HttpResponse {
    pub message: Message,
    pub body_size: usize,
    /// The body was truncated but salvaged by trimming the batch tail.
    pub recovered: bool,
}

#[derive(Debug)]
pub struct HttpTransport {
    host: String,
    url: String,
    key: Option<String>,
    /// Reply-header cache for the key-hack (no key configured).
    reply_key: Mutex<Option<Header>>,
    cipher_key: Option<[u8; 32]>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(host: &str, key: Option<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()?;
        Ok(Self {
            host: host.to_owned(),
            url: format!("http://{host}/config"),
            key,
            reply_key: Mutex::new(None),
            cipher_key: None,
            client,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: &str) {
        self.host = host.to_owned();
        self.url = format!("http://{host}/config");
    }

    /// Derives and installs the AES key for encrypted-body firmwares.
    pub fn enable_encryption(&mut self, uuid: &str, key: &str, mac: &str) {
        let hex = encryption_key(uuid, key, mac);
        let mut cipher_key = [0u8; 32];
        cipher_key.copy_from_slice(hex.as_bytes());
        self.cipher_key = Some(cipher_key);
        debug!(host = %self.host, "http body encryption enabled");
    }

    /// One logical RPC call: build, send, decode, with the key-hack retry on
    /// an invalid-key reply.
    pub async fn request(
        &self,
        namespace: &str,
        method: Method,
        payload: Value,
    ) -> Result<HttpResponse, TransportError> {
        let seed = self.signing_seed();
        let request = message::build(namespace, method, payload.clone(), &seed, MANUFACTURER);
        let mut response = self.roundtrip(&request).await?;

        if response.message.error_code() == Some(crate::protocol::ERROR_CODE_INVALID_KEY) {
            if self.key.is_some() {
                return Err(ProtocolError::Signature.into());
            }
            warn!(
                host = %self.host,
                namespace,
                "invalid key reply, retrying with reply-header seed"
            );
            let seed = DeviceKey::Reply(response.message.header.clone());
            let retry = message::build(namespace, method, payload, &seed, MANUFACTURER);
            response = match self.roundtrip(&retry).await {
                Ok(response) => response,
                // failures here are almost surely consequences of the hack
                Err(_) => return Err(ProtocolError::Signature.into()),
            };
        }
        if self.key.is_none() {
            if let Ok(mut cached) = self.reply_key.lock() {
                *cached = Some(response.message.header.clone());
            }
        }
        Ok(response)
    }

    /// [`HttpTransport::request`] plus rejection of protocol-level `ERROR`
    /// replies.
    pub async fn request_strict(
        &self,
        namespace: &str,
        method: Method,
        payload: Value,
    ) -> Result<HttpResponse, TransportError> {
        let response = self.request(namespace, method, payload).await?;
        let message = message::check_strict(response.message)?;
        Ok(HttpResponse { message, ..response })
    }

    fn signing_seed(&self) -> DeviceKey {
        if let Some(key) = &self.key {
            return DeviceKey::Shared(key.clone());
        }
        let cached = self.reply_key.lock().ok().and_then(|guard| guard.clone());
        match cached {
            Some(header) => DeviceKey::Reply(header),
            None => DeviceKey::Shared(String::new()),
        }
    }

    async fn roundtrip(&self, request: &Message) -> Result<HttpResponse, TransportError> {
        let body = request.encode()?;
        match self.send_raw(body).await {
            Ok(text) => decode_response(&text),
            Err(err) => {
                // the cached reply header may have gone stale
                if let Ok(mut cached) = self.reply_key.lock() {
                    *cached = None;
                }
                Err(err)
            }
        }
    }

    async fn send_raw(&self, body: String) -> Result<String, TransportError> {
        let (body, content_type) = match &self.cipher_key {
            Some(key) => (encrypt_body(key, &body), "application/octet-stream"),
            None => (body, "application/json"),
        };
        let mut attempt_timeout = FIRST_ATTEMPT_TIMEOUT;
        let response = loop {
            let attempt = self
                .client
                .post(&self.url)
                .header(CONTENT_TYPE, content_type)
                .body(body.clone())
                .timeout(attempt_timeout)
                .send()
                .await;
            match attempt {
                Ok(response) => break response,
                Err(err) if err.is_timeout() => {
                    if attempt_timeout >= TOTAL_TIMEOUT {
                        return Err(TransportError::Timeout);
                    }
                    debug!(
                        host = %self.host,
                        timeout_ms = attempt_timeout.as_millis() as u64,
                        "device stalled, doubling attempt timeout"
                    );
                    attempt_timeout *= 2;
                }
                Err(err) => return Err(err.into()),
            }
        };
        if !response.status().is_success() {
            return Err(TransportError::Rejected(response.status().to_string()));
        }
        let text = response.text().await?;
        match &self.cipher_key {
            Some(key) => decrypt_body(key, &text),
            None => Ok(text),
        }
    }
}

fn encrypt_body(key: &[u8; 32], body: &str) -> String {
    let mut data = body.as_bytes().to_vec();
    let tail = data.len() % 16;
    if tail != 0 {
        data.resize(data.len() + 16 - tail, 0);
    }
    let ciphertext =
        Aes256CbcEnc::new(key.into(), ZERO_IV.into()).encrypt_padded_vec_mut::<NoPadding>(&data);
    BASE64.encode(ciphertext)
}

fn decrypt_body(key: &[u8; 32], body: &str) -> Result<String, TransportError> {
    let data = BASE64
        .decode(body.trim())
        .map_err(|err| TransportError::Connection(format!("bad base64 body: {err}")))?;
    let plaintext = Aes256CbcDec::new(key.into(), ZERO_IV.into())
        .decrypt_padded_vec_mut::<NoPadding>(&data)
        .map_err(|err| TransportError::Connection(format!("bad encrypted body: {err}")))?;
    let text = String::from_utf8(plaintext)
        .map_err(|err| TransportError::Connection(format!("bad utf8 body: {err}")))?;
    Ok(text.trim_end_matches('\0').to_owned())
}

fn decode_response(body: &str) -> Result<HttpResponse, TransportError> {
    match Message::decode(body) {
        Ok(message) => Ok(HttpResponse {
            message,
            body_size: body.len(),
            recovered: false,
        }),
        Err(ProtocolError::Json(err)) if error_near_end(&err, body) => {
            if let Some(salvaged) = salvage_multiple(body) {
                if let Ok(message) = Message::decode(&salvaged) {
                    warn!(
                        size = body.len(),
                        "truncated batch reply salvaged by trimming the tail"
                    );
                    return Ok(HttpResponse {
                        message,
                        body_size: body.len(),
                        recovered: true,
                    });
                }
            }
            Err(TransportError::Truncated { size: body.len() })
        }
        Err(err) => Err(err.into()),
    }
}

/// The device cut the body off rather than sending garbage: the decode error
/// sits in the last tenth of the payload.
fn error_near_end(err: &serde_json::Error, body: &str) -> bool {
    err.is_eof() || err.column() * 10 >= body.len() * 9
}

/// Drops the last, incomplete sub-message from a truncated
/// `Appliance.Control.Multiple` reply and closes the array again.
fn salvage_multiple(body: &str) -> Option<String> {
    if !body.contains("Appliance.Control.Multiple") {
        return None;
    }
    let cut = body.rfind(",{\"header\"")?;
    let mut salvaged = body[..cut].to_owned();
    salvaged.push_str("]}}");
    Some(salvaged)
}
