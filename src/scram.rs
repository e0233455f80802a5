//! SCRAM-SHA-256 authentication (RFC 5802 / RFC 7677).
//!
//! The client side of the exchange PostgreSQL runs for `AuthenticationSASL`.
//! Channel binding is not offered (`n,,` GS2 header).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("malformed server message")]
    InvalidServerMessage,
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server signature verification failed")]
    ServerSignature,
    #[error("exchange out of order")]
    OutOfOrder,
}

/// State carried across the two client messages of the exchange.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    /// Deterministic constructor, used by tests to pin the nonce.
    pub(crate) fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    /// `client-first-message`: `n,,n=<user>,r=<nonce>`.
    ///
    /// PostgreSQL takes the authentication identity from the startup packet,
    /// so the username here is advisory; it still goes through the minimal
    /// `,`/`=` escaping SASLprep requires.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    fn client_first_bare(&self) -> String {
        let name = self.username.replace('=', "=3D").replace(',', "=2C");
        format!("n={},r={}", name, self.client_nonce)
    }

    /// Consume `server-first-message` (`r=<nonce>,s=<salt>,i=<n>`) and
    /// produce `client-final-message`.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(v)
                        .map_err(|_| ScramError::InvalidServerMessage)?,
                );
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = Some(
                    v.parse::<u32>()
                        .map_err(|_| ScramError::InvalidServerMessage)?,
                );
            }
        }
        let combined_nonce = nonce.ok_or(ScramError::InvalidServerMessage)?;
        let salt = salt.ok_or(ScramError::InvalidServerMessage)?;
        let iterations = iterations.ok_or(ScramError::InvalidServerMessage)?;

        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = hi(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = [0u8; 32];
        for i in 0..32 {
            proof[i] = client_key[i] ^ client_signature[i];
        }

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Verify `server-final-message` (`v=<signature>`).
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::InvalidServerMessage)?;
        let server_signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::InvalidServerMessage)?;

        let salted_password = self.salted_password.ok_or(ScramError::OutOfOrder)?;
        let auth_message = self.auth_message.as_ref().ok_or(ScramError::OutOfOrder)?;

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());
        if server_signature != expected {
            return Err(ScramError::ServerSignature);
        }
        Ok(())
    }
}

/// Hi(): PBKDF2 with HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut out)
        .expect("output length is valid");
    out
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 §3 test vector.
    const USER: &str = "user";
    const PASSWORD: &str = "pencil";
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn rfc7677_exchange() {
        let mut client = ScramClient::with_nonce(USER, PASSWORD, CLIENT_NONCE);

        let first = String::from_utf8(client.client_first_message()).unwrap();
        assert_eq!(first, "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let final_msg = client.process_server_first(SERVER_FIRST.as_bytes()).unwrap();
        let final_str = String::from_utf8(final_msg).unwrap();
        assert_eq!(
            final_str,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        client.verify_server_final(SERVER_FINAL.as_bytes()).unwrap();
    }

    #[test]
    fn rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce(USER, PASSWORD, CLIENT_NONCE);
        let err = client
            .process_server_first(b"r=stolen-nonce,s=c2FsdA==,i=4096")
            .unwrap_err();
        assert_eq!(err, ScramError::NonceMismatch);
    }

    #[test]
    fn rejects_bad_server_signature() {
        let mut client = ScramClient::with_nonce(USER, PASSWORD, CLIENT_NONCE);
        client.process_server_first(SERVER_FIRST.as_bytes()).unwrap();
        let err = client
            .verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert_eq!(err, ScramError::ServerSignature);
    }

    #[test]
    fn verify_before_challenge_is_out_of_order() {
        let client = ScramClient::with_nonce(USER, PASSWORD, CLIENT_NONCE);
        let err = client.verify_server_final(SERVER_FINAL.as_bytes()).unwrap_err();
        assert_eq!(err, ScramError::OutOfOrder);
    }

    #[test]
    fn username_escaping() {
        let client = ScramClient::with_nonce("a,b=c", PASSWORD, CLIENT_NONCE);
        let first = String::from_utf8(client.client_first_message()).unwrap();
        assert!(first.starts_with("n,,n=a=2Cb=3Dc,r="));
    }
}
