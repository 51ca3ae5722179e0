//! Client side of the SCRAM challenge-response exchange (RFC 5802 / RFC 7677).
//!
//! A [`ScramClient`] is created for a single connection attempt:
//!
//! 1. [`ScramClient::begin`] stores the credentials and opens a conversation,
//! 2. [`ScramClient::step`] is fed `""` to obtain the client-first message, then every
//!    server challenge in turn,
//! 3. [`ScramClient::done`] reports completion once the server signature is verified.
//!
//! The instance must not be reused for another connection.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{digest::KeyInit, Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

pub(crate) const CLIENT_KEY: &[u8] = b"Client Key";
pub(crate) const SERVER_KEY: &[u8] = b"Server Key";
const NONCE_LEN: usize = 18;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("invalid credentials, {0}")]
    InvalidCredentials(String),
    #[error("conversation not started")]
    NotStarted,
    #[error("conversation already finished")]
    Finished,
    #[error("malformed server message, {0}")]
    Malformed(String),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server signature mismatch")]
    ServerSignature,
    #[error("server rejected authentication, {0}")]
    Server(String),
    #[error("unsupported mechanism, {0}")]
    UnsupportedMechanism(String),
}

/// Hash function the conversation is built on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "SCRAM-SHA-256", alias = "sha256", alias = "SHA256", alias = "scram-sha-256")]
    Sha256,
    #[serde(rename = "SCRAM-SHA-512", alias = "sha512", alias = "SHA512", alias = "scram-sha-512")]
    Sha512,
}

impl HashAlgorithm {
    /// SASL mechanism name
    #[inline]
    pub fn mechanism(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "SCRAM-SHA-256",
            HashAlgorithm::Sha512 => "SCRAM-SHA-512",
        }
    }

    #[inline]
    fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub(crate) fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    pub(crate) fn hmac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
        match self {
            HashAlgorithm::Sha256 => mac::<Hmac<Sha256>>(key, data),
            HashAlgorithm::Sha512 => mac::<Hmac<Sha512>>(key, data),
        }
    }

    /// Hi(password, salt, i), i.e. PBKDF2 with HMAC of this algorithm
    pub(crate) fn salted_password(&self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut out = vec![0u8; self.output_len()];
        match self {
            HashAlgorithm::Sha256 => pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out),
            HashAlgorithm::Sha512 => pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out),
        }
        out
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mechanism())
    }
}

impl FromStr for HashAlgorithm {
    type Err = ScramError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('_', "-").as_str() {
            "SCRAM-SHA-256" | "SHA256" | "SHA-256" => Ok(HashAlgorithm::Sha256),
            "SCRAM-SHA-512" | "SHA512" | "SHA-512" => Ok(HashAlgorithm::Sha512),
            _ => Err(ScramError::UnsupportedMechanism(s.into())),
        }
    }
}

fn mac<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
    let mut mac =
        <M as KeyInit>::new_from_slice(key).map_err(|e| ScramError::InvalidCredentials(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `=` and `,` are reserved in SCRAM attribute values
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn gen_nonce() -> String {
    BASE64.encode(rand::random::<[u8; NONCE_LEN]>())
}

/// The Begin / Step / Done contract a broker connection uses to authenticate.
pub trait Authenticator: Send {
    fn begin(&mut self, user: &str, password: &str, authz_id: &str) -> Result<(), ScramError>;
    fn step(&mut self, challenge: &str) -> Result<String, ScramError>;
    fn done(&self) -> bool;
}

struct Credentials {
    username: String,
    password: String,
    authz_id: String,
}

enum Conversation {
    Start { nonce: String },
    ServerFirst { nonce: String, gs2_header: String, client_first_bare: String },
    ServerFinal { server_signature: Vec<u8> },
    Done,
    Failed,
}

/// SCRAM client: owned credentials, owned conversation and the hash algorithm selector
pub struct ScramClient {
    algorithm: HashAlgorithm,
    client: Option<Credentials>,
    conversation: Option<Conversation>,
    fixed_nonce: Option<String>,
}

impl ScramClient {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm, client: None, conversation: None, fixed_nonce: None }
    }

    /// Use `nonce` instead of a random client nonce
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.fixed_nonce = Some(nonce.into());
        self
    }

    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    fn client_first(&mut self, nonce: String) -> Result<String, ScramError> {
        let creds = self.client.as_ref().ok_or(ScramError::NotStarted)?;
        let gs2_header = if creds.authz_id.is_empty() {
            "n,,".to_string()
        } else {
            format!("n,a={},", escape_name(&creds.authz_id))
        };
        let client_first_bare = format!("n={},r={}", escape_name(&creds.username), nonce);
        let msg = format!("{gs2_header}{client_first_bare}");
        self.conversation = Some(Conversation::ServerFirst { nonce, gs2_header, client_first_bare });
        Ok(msg)
    }

    fn client_final(
        &mut self,
        challenge: &str,
        nonce: &str,
        gs2_header: &str,
        client_first_bare: &str,
    ) -> Result<String, ScramError> {
        let creds = self.client.as_ref().ok_or(ScramError::NotStarted)?;

        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in challenge.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => server_nonce = Some(v),
                Some(("s", v)) => {
                    salt = Some(BASE64.decode(v).map_err(|e| ScramError::Malformed(format!("salt, {e}")))?)
                }
                Some(("i", v)) => {
                    iterations =
                        Some(v.parse::<u32>().map_err(|e| ScramError::Malformed(format!("iterations, {e}")))?)
                }
                Some(("e", v)) => return Err(ScramError::Server(v.into())),
                Some(("m", _)) => return Err(ScramError::Malformed("unsupported mandatory extension".into())),
                _ => {}
            }
        }
        let server_nonce = server_nonce.ok_or_else(|| ScramError::Malformed("missing nonce".into()))?;
        let salt = salt.ok_or_else(|| ScramError::Malformed("missing salt".into()))?;
        let iterations = match iterations {
            Some(0) | None => return Err(ScramError::Malformed("missing iteration count".into())),
            Some(i) => i,
        };
        if server_nonce.len() <= nonce.len() || !server_nonce.starts_with(nonce) {
            return Err(ScramError::NonceMismatch);
        }

        let alg = self.algorithm;
        let salted_password = alg.salted_password(creds.password.as_bytes(), &salt, iterations);
        let client_key = alg.hmac(&salted_password, CLIENT_KEY)?;
        let stored_key = alg.hash(&client_key);

        let client_final_without_proof =
            format!("c={},r={}", BASE64.encode(gs2_header.as_bytes()), server_nonce);
        let auth_message = format!("{client_first_bare},{challenge},{client_final_without_proof}");

        let client_signature = alg.hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key.iter().zip(client_signature.iter()).map(|(a, b)| a ^ b).collect();

        let server_key = alg.hmac(&salted_password, SERVER_KEY)?;
        let server_signature = alg.hmac(&server_key, auth_message.as_bytes())?;

        self.conversation = Some(Conversation::ServerFinal { server_signature });
        Ok(format!("{client_final_without_proof},p={}", BASE64.encode(proof)))
    }

    fn verify_server_final(challenge: &str, server_signature: &[u8]) -> Result<(), ScramError> {
        for attr in challenge.split(',') {
            match attr.split_once('=') {
                Some(("e", v)) => return Err(ScramError::Server(v.into())),
                Some(("v", v)) => {
                    let verifier =
                        BASE64.decode(v).map_err(|e| ScramError::Malformed(format!("verifier, {e}")))?;
                    return if constant_time_eq(&verifier, server_signature) {
                        Ok(())
                    } else {
                        Err(ScramError::ServerSignature)
                    };
                }
                _ => {}
            }
        }
        Err(ScramError::Malformed("missing verifier".into()))
    }
}

impl Authenticator for ScramClient {
    fn begin(&mut self, user: &str, password: &str, authz_id: &str) -> Result<(), ScramError> {
        if user.is_empty() {
            return Err(ScramError::InvalidCredentials("empty username".into()));
        }
        if user.contains('\0') || password.contains('\0') || authz_id.contains('\0') {
            return Err(ScramError::InvalidCredentials("NUL character".into()));
        }
        self.client = Some(Credentials {
            username: user.into(),
            password: password.into(),
            authz_id: authz_id.into(),
        });
        let nonce = self.fixed_nonce.clone().unwrap_or_else(gen_nonce);
        self.conversation = Some(Conversation::Start { nonce });
        Ok(())
    }

    fn step(&mut self, challenge: &str) -> Result<String, ScramError> {
        let conversation = self.conversation.replace(Conversation::Failed).ok_or(ScramError::NotStarted)?;
        match conversation {
            Conversation::Start { nonce } => self.client_first(nonce),
            Conversation::ServerFirst { nonce, gs2_header, client_first_bare } => {
                self.client_final(challenge, &nonce, &gs2_header, &client_first_bare)
            }
            Conversation::ServerFinal { server_signature } => {
                Self::verify_server_final(challenge, &server_signature)?;
                self.conversation = Some(Conversation::Done);
                Ok(String::new())
            }
            Conversation::Done => {
                self.conversation = Some(Conversation::Done);
                Err(ScramError::Finished)
            }
            Conversation::Failed => Err(ScramError::Finished),
        }
    }

    #[inline]
    fn done(&self) -> bool {
        matches!(self.conversation, Some(Conversation::Done))
    }
}

/// Run a complete exchange: begin, send the client-first message, then answer every
/// server challenge until the conversation is done. `exchange` sends one client message
/// and resolves to the server's reply.
pub async fn drive_handshake<A, F, Fut>(
    auth: &mut A,
    user: &str,
    password: &str,
    mut exchange: F,
) -> Result<(), crate::Error>
where
    A: Authenticator,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<String, crate::Error>>,
{
    auth.begin(user, password, "")?;
    let mut msg = auth.step("")?;
    while !auth.done() {
        let challenge = exchange(msg).await?;
        msg = auth.step(&challenge)?;
    }
    Ok(())
}
