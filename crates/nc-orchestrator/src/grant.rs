//! Provisioning grants
//!
//! A grant is a one-time secret minted when a master is provisioned and
//! delivered to it out of band. Presenting it on first contact approves the
//! master automatically; once it has done so it never matches again.

use std::fmt;

use rand::Rng;
use subtle::ConstantTimeEq;

use crate::registry::MasterGuard;

/// Length of a grant in bytes (before hex encoding)
const GRANT_BYTES: usize = 32;

/// A one-time provisioning secret.
///
/// `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Grant(String);

impl Grant {
    /// The secret, for out-of-band delivery to the master
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Grant(<redacted>)")
    }
}

/// Mints grants and checks presented ones
#[derive(Debug, Default)]
pub struct GrantIssuer;

impl GrantIssuer {
    /// Create a new issuer
    pub fn new() -> Self {
        Self
    }

    /// Mint a fresh grant, store it on the entry and return it.
    ///
    /// Any previous grant on the entry is replaced.
    pub fn issue(&self, master: &mut MasterGuard<'_>) -> Grant {
        let grant = Grant(generate_secret());
        master.store_grant(grant.clone());
        tracing::debug!("Issued grant for master {}", master.organization());
        grant
    }

    /// Whether `presented` is the entry's live (unconsumed) grant.
    ///
    /// The comparison runs in constant time with respect to the content.
    pub fn matches(&self, master: &MasterGuard<'_>, presented: Option<&str>) -> bool {
        let (Some(presented), Some(expected)) = (presented, master.live_grant()) else {
            return false;
        };

        let presented = presented.as_bytes();
        let expected = expected.expose().as_bytes();

        if presented.len() != expected.len() {
            return false;
        }

        presented.ct_eq(expected).into()
    }
}

/// 32 random bytes, hex-encoded (64 chars)
fn generate_secret() -> String {
    let mut bytes = [0u8; GRANT_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
