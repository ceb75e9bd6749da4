/*!
Crypto things
*/
use ring::hmac;

/// Return a `Vec` of secure random bytes of size `n`
pub fn rand_bytes(n: usize) -> crate::Result<Vec<u8>> {
    use ring::rand::SecureRandom;
    let mut buf = vec![0; n];
    let sysrand = ring::rand::SystemRandom::new();
    sysrand
        .fill(&mut buf)
        .map_err(|_| se!("Error getting random bytes"))?;
    Ok(buf)
}

/// A new, hex encoded, session identifier
pub fn new_session_id() -> crate::Result<String> {
    Ok(hex::encode(rand_bytes(32)?))
}

/// Signs and verifies session identifiers so a session
/// cookie can't be forged without the application secret.
#[derive(Clone)]
pub struct SessionSigner {
    key: hmac::Key,
}

impl SessionSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
        }
    }

    pub fn hmac_sign(&self, s: &str) -> String {
        let tag = hmac::sign(&self.key, s.as_bytes());
        hex::encode(&tag)
    }

    /// `<id>.<signature>`
    pub fn sign(&self, session_id: &str) -> String {
        format!("{}.{}", session_id, self.hmac_sign(session_id))
    }

    /// Return the session id of a signed cookie value if
    /// the signature checks out.
    pub fn verify(&self, signed: &str) -> Option<String> {
        let mut parts = signed.splitn(2, '.');
        let session_id = parts.next()?;
        let signature = hex::decode(parts.next()?).ok()?;
        if session_id.is_empty() {
            return None;
        }
        hmac::verify(&self.key, session_id.as_bytes(), &signature)
            .ok()
            .map(|_| session_id.to_string())
    }
}
