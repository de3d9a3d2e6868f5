//! In-memory protection for the process's long-lived signing keys.
//!
//! The CA's root signing key and the token service's RSA key are each held
//! for the entire process lifetime. Both are wrapped the same way: DER bytes
//! inside a `secrecy::Secret`, zeroized on drop, never reachable through a
//! `Debug` impl.
//!
//! ## Security properties
//!
//! - Key material never appears in a `{:?}` / log line.
//! - Key bytes are zeroized as soon as the holder is dropped.
//! - Exposure is explicit (`expose_secret`) and meant for short-lived use
//!   (signing a single token or certificate), not for holding a borrow
//!   across an await point.

use anyhow::Context as _;
use secrecy::{ExposeSecret, SecretBox};
use zeroize::Zeroize;

/// A DER-encoded private key, held zeroized in memory for the life of the
/// process.
pub struct ProtectedKey {
    der: SecretBox<DerBytes>,
}

#[derive(Clone, Default)]
pub struct DerBytes(Vec<u8>);

impl Zeroize for DerBytes {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl ProtectedKey {
    pub fn from_der(der: Vec<u8>) -> Self {
        Self {
            der: SecretBox::new(Box::new(DerBytes(der))),
        }
    }

    /// Expose the DER bytes. Do not hold the returned reference across an
    /// `.await` point or store it anywhere; reconstruct the signing key from
    /// it immediately and let it drop.
    pub fn expose_der(&self) -> &[u8] {
        &self.der.expose_secret().0
    }

    pub fn to_picky_private_key(&self) -> anyhow::Result<picky::key::PrivateKey> {
        picky::key::PrivateKey::from_pkcs8(self.expose_der()).context("malformed private key DER")
    }
}

impl core::fmt::Debug for ProtectedKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProtectedKey").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_picky() {
        let key = picky::key::PrivateKey::generate_rsa(2048).expect("keygen");
        let der = key.to_pkcs8().expect("to der");

        let protected = ProtectedKey::from_der(der.clone());

        assert_eq!(protected.expose_der(), der.as_slice());
        protected.to_picky_private_key().expect("key reconstructs");
    }

    #[test]
    fn debug_does_not_leak_key_material() {
        let protected = ProtectedKey::from_der(vec![1, 2, 3, 4]);
        let rendered = format!("{protected:?}");
        assert!(!rendered.contains('1'));
    }
}
