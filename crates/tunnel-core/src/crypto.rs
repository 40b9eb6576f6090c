use russh::{
    Preferred,
    keys::{Algorithm, HashAlg},
};
use std::borrow::Cow;

/// Host key algorithm negotiated for a client key of the given algorithm.
///
/// RSA keys are offered as `rsa-sha2-256`; servers commonly refuse SHA-1 `ssh-rsa`.
pub fn host_key_algorithm_for(algorithm: &Algorithm) -> Algorithm {
    match algorithm {
        Algorithm::Rsa { .. } => Algorithm::Rsa {
            hash: Some(HashAlg::Sha256),
        },
        other => other.clone(),
    }
}

/// Signature hash used when authenticating with a key of the given algorithm.
pub fn auth_hash_for(algorithm: &Algorithm) -> Option<HashAlg> {
    match algorithm {
        Algorithm::Rsa { .. } => Some(HashAlg::Sha256),
        _ => None,
    }
}

/// Default preferences restricted to exactly one host key algorithm.
pub fn single_host_key_preferred(algorithm: &Algorithm) -> Preferred {
    Preferred {
        key: Cow::Owned(vec![host_key_algorithm_for(algorithm)]),
        ..Preferred::DEFAULT.clone()
    }
}
