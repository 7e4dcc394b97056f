//! Keyed BLAKE3 signatures for media links and payment webhooks.

const MEDIA_CONTEXT: &str = "course-server 2025-01-01 signed media url";
const WEBHOOK_CONTEXT: &str = "course-server 2025-01-01 payment webhook";

#[derive(Clone)]
pub struct Signer {
    key: [u8; 32],
}

impl Signer {
    fn new(context: &str, secret: &str) -> Self {
        Self {
            key: blake3::derive_key(context, secret.as_bytes()),
        }
    }

    pub fn media(secret: &str) -> Self {
        Self::new(MEDIA_CONTEXT, secret)
    }

    pub fn webhook(secret: &str) -> Self {
        Self::new(WEBHOOK_CONTEXT, secret)
    }

    pub fn sign(&self, data: &[u8]) -> String {
        blake3::keyed_hash(&self.key, data).to_hex().to_string()
    }

    /// Constant-time comparison against a hex signature.
    pub fn verify(&self, data: &[u8], signature: &str) -> bool {
        match blake3::Hash::from_hex(signature) {
            Ok(expected) => blake3::keyed_hash(&self.key, data) == expected,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_do_not_cross() {
        let media = Signer::media("secret");
        let webhook = Signer::webhook("secret");
        let sig = media.sign(b"videos/a.mp4");
        assert!(media.verify(b"videos/a.mp4", &sig));
        assert!(!webhook.verify(b"videos/a.mp4", &sig));
        assert!(!media.verify(b"videos/b.mp4", &sig));
        assert!(!media.verify(b"videos/a.mp4", "not-hex"));
        assert!(!Signer::media("other").verify(b"videos/a.mp4", &sig));
    }
}
