//! Host key blueprints and trust-on-first-use pinning.
//!
//! A blueprint is the first eight characters of the standard Base64 encoding
//! of the SHA3-256 digest of the host key in SSH wire encoding. Operators
//! record it out of band, so the computation must stay byte-for-byte stable.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use once_cell::sync::OnceCell;
use russh::keys::PublicKey;
use sha3::{Digest, Sha3_256};
use tracing::{debug, error, info};

use crate::error::{TunnelError, TunnelResult};

/// Number of Base64 characters kept from the digest.
pub const BLUEPRINT_LEN: usize = 8;

/// Blueprint of an already wire-encoded public key.
pub fn blueprint_of_bytes(data: &[u8]) -> String {
    let digest = Sha3_256::digest(data);
    let mut encoded = BASE64.encode(digest);
    encoded.truncate(BLUEPRINT_LEN);
    encoded
}

/// Blueprint of a host public key.
pub fn key_blueprint(key: &PublicKey) -> TunnelResult<String> {
    let wire = key
        .to_bytes()
        .map_err(TunnelError::host_key_encoding)?;
    Ok(blueprint_of_bytes(&wire))
}

/// Pins the server identity for one session.
///
/// The pinned slot is written at most once. A session without a configured
/// blueprint learns it from the first host key presented during the
/// handshake and enforces it from then on.
#[derive(Clone, Debug)]
pub struct HostIdentityVerifier {
    pinned: Arc<OnceCell<String>>,
}

impl HostIdentityVerifier {
    /// Create a verifier seeded with an optional configured blueprint.
    ///
    /// An empty string counts as "not configured".
    pub fn new(configured: Option<String>) -> Self {
        let pinned = OnceCell::new();
        if let Some(blueprint) = configured.filter(|value| !value.is_empty()) {
            let _ = pinned.set(blueprint);
        }
        Self { pinned: Arc::new(pinned) }
    }

    /// Currently pinned blueprint, if any.
    pub fn pinned(&self) -> Option<&str> {
        self.pinned.get().map(String::as_str)
    }

    /// Check a host key presented during the handshake.
    ///
    /// Returns the observed blueprint on success.
    pub fn verify(&self, key: &PublicKey) -> TunnelResult<String> {
        let observed = key_blueprint(key)?;
        self.verify_blueprint(observed)
    }

    /// Pin-or-compare decision on an already computed blueprint.
    pub fn verify_blueprint(&self, observed: String) -> TunnelResult<String> {
        if let Some(pinned) = self.pinned.get() {
            return self.compare(pinned, observed);
        }
        let pinned = self.pinned.get_or_init(|| observed.clone());
        if *pinned == observed {
            info!(blueprint = %observed, "trusting host key on first use");
            return Ok(observed);
        }
        self.compare(pinned, observed)
    }

    fn compare(&self, pinned: &str, observed: String) -> TunnelResult<String> {
        if pinned == observed {
            debug!(blueprint = %observed, "host key blueprint verified");
            Ok(observed)
        } else {
            error!(blueprint = %observed, expected = pinned, "invalid key blueprint");
            Err(TunnelError::HostVerification { fingerprint: observed })
        }
    }
}
