//! SCRAM-SHA-256 authentication (RFC 5802, RFC 7677).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// GS2 header without channel binding, base64 encoded as sent in `c=`.
const GS2_HEADER_B64: &str = "biws";

/// SCRAM authentication errors.
#[derive(Debug, Clone, Error)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Server message is missing attribute '{0}'")]
    MissingAttribute(char),
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("Server signature verification failed")]
    ServerSignatureMismatch,
    #[error("Server reported error: {0}")]
    Server(String),
    #[error("SCRAM exchange out of order")]
    OutOfOrder,
    #[error("Key derivation failed")]
    KeyDerivation,
}

enum State {
    /// client-first sent, waiting for server-first
    Initial,
    /// client-final sent, waiting for server-final
    ProofSent {
        salted_password: [u8; 32],
        auth_message: String,
    },
}

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    state: State,
}

impl ScramClient {
    pub const MECHANISM: &'static str = "SCRAM-SHA-256";

    /// Create a client with a fresh random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            state: State::Initial,
        }
    }

    fn client_first_bare(&self) -> String {
        // The server takes the user from the startup packet; the name here
        // only needs to be well formed.
        format!(
            "n={},r={}",
            self.username.replace('=', "=3D").replace(',', "=2C"),
            self.client_nonce
        )
    }

    /// `n,,n=<user>,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consume `r=<nonce>,s=<salt>,i=<iterations>` and produce client-final.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.state, State::Initial) {
            return Err(ScramError::OutOfOrder);
        }

        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let nonce = attribute(server_first, 'r')?;
        let salt = BASE64
            .decode(attribute(server_first, 's')?)
            .map_err(|_| ScramError::InvalidSalt)?;
        let iterations: u32 = attribute(server_first, 'i')?
            .parse()
            .map_err(|_| ScramError::InvalidIterations)?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = salted_password(&self.password, &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={},r={}", GS2_HEADER_B64, nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.state = State::ProofSent {
            salted_password,
            auth_message,
        };

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `v=<server-signature>` against the expected signature.
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let State::ProofSent {
            salted_password,
            auth_message,
        } = &self.state
        else {
            return Err(ScramError::OutOfOrder);
        };

        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;
        if let Ok(reason) = attribute(server_final, 'e') {
            return Err(ScramError::Server(reason.to_string()));
        }

        let signature = BASE64
            .decode(attribute(server_final, 'v')?)
            .map_err(|_| ScramError::InvalidServerMessage)?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if signature != expected {
            return Err(ScramError::ServerSignatureMismatch);
        }
        Ok(())
    }
}

/// Value of a `k=value` attribute in a comma separated SCRAM message.
fn attribute(msg: &str, key: char) -> Result<&str, ScramError> {
    msg.split(',')
        .find_map(|part| {
            let mut chars = part.chars();
            match (chars.next(), chars.next()) {
                (Some(k), Some('=')) if k == key => Some(&part[2..]),
                _ => None,
            }
        })
        .ok_or(ScramError::MissingAttribute(key))
}

/// Hi(password, salt, i): PBKDF2 with HMAC-SHA-256.
fn salted_password(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::KeyDerivation)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vector from RFC 7677 section 3
    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn test_rfc7677_exchange() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);
        assert_eq!(
            client.client_first_message(),
            b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec()
        );

        let client_final = client.process_server_first(SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(client_final).unwrap(), CLIENT_FINAL);

        client.verify_server_final(SERVER_FINAL.as_bytes()).unwrap();
    }

    #[test]
    fn test_wrong_server_signature_rejected() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);
        client.process_server_first(SERVER_FIRST.as_bytes()).unwrap();

        let forged = format!("v={}", BASE64.encode([0u8; 32]));
        assert!(matches!(
            client.verify_server_final(forged.as_bytes()),
            Err(ScramError::ServerSignatureMismatch)
        ));
    }

    #[test]
    fn test_foreign_nonce_rejected() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);
        let msg = "r=somebodyelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        assert!(matches!(
            client.process_server_first(msg.as_bytes()),
            Err(ScramError::NonceMismatch)
        ));
    }

    #[test]
    fn test_final_before_first_is_out_of_order() {
        let client = ScramClient::new("user", "pencil");
        assert!(matches!(
            client.verify_server_final(SERVER_FINAL.as_bytes()),
            Err(ScramError::OutOfOrder)
        ));
    }

    #[test]
    fn test_missing_attribute() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);
        let msg = format!("r={}xyz,i=4096", NONCE);
        assert!(matches!(
            client.process_server_first(msg.as_bytes()),
            Err(ScramError::MissingAttribute('s'))
        ));
    }
}
