//! Internal certificate authority and WireGuard IP address management.
//!
//! The CA issues leaf certificates for headends and clients; the IPAM
//! allocator hands out stable addresses from the overlay CIDR. Both share
//! one module because every WireGuard peer also needs a certificate, and
//! both guard long-lived state behind a single critical section.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use picky::key::PrivateKey;
use picky::pem::Pem;
use picky::x509::certificate::CertificateBuilder;
use picky::x509::name::DirectoryName;
use picky::x509::date::UtcDate;
use picky::x509::extension::ExtendedKeyUsage;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use serde::Serialize;
use time::{Duration as TimeDuration, OffsetDateTime};
use uuid::Uuid;

use crate::config::dto::CaKeySource;
use crate::crypto::master_key::ProtectedKey;
use crate::error::{ControlPlaneError, Result};

/// `10.200.0.0/16`, fixed per SPEC_FULL.md §4.1.
pub const OVERLAY_CIDR: &str = "10.200.0.0/16";

#[derive(Debug, Clone, Serialize)]
pub struct WireGuardPeer {
    pub node_id: String,
    pub node_type: String,
    pub public_key: String,
    pub ip_address: Ipv4Addr,
    /// `{ip_address}/32`, the form the headend config's peer list wires
    /// straight into `AllowedIPs`.
    pub allowed_ips: Vec<String>,
    pub revoked: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
}

struct IpamEntry {
    peer: WireGuardPeer,
    private_key_b64: String,
}

struct Inner {
    network: Ipv4Network,
    entries: HashMap<String, IpamEntry>,
    by_ip: HashMap<Ipv4Addr, String>,
    grace_period: TimeDuration,
}

impl Inner {
    fn reserved(&self, addr: Ipv4Addr) -> bool {
        addr == self.network.network() || addr == self.network.broadcast() || addr == primary_headend_ip(&self.network)
    }

    fn is_free(&self, addr: Ipv4Addr, now: OffsetDateTime) -> bool {
        if self.reserved(addr) {
            return false;
        }
        match self.by_ip.get(&addr) {
            None => true,
            Some(node_id) => {
                let entry = &self.entries[node_id];
                entry.peer.revoked
                    && entry
                        .peer
                        .revoked_at
                        .is_some_and(|revoked_at| now >= revoked_at + self.grace_period)
            }
        }
    }

    fn first_free(&self, now: OffsetDateTime) -> Option<Ipv4Addr> {
        self.network.iter().find(|addr| self.is_free(*addr, now))
    }
}

fn primary_headend_ip(network: &Ipv4Network) -> Ipv4Addr {
    let octets = network.network().octets();
    Ipv4Addr::new(octets[0], octets[1], octets[2], 1)
}

pub struct CertificateAuthority {
    signing_key: ProtectedKey,
    ca_cert_pem: String,
    /// The real root, re-derived into `rcgen` terms once at bootstrap so
    /// every leaf signs against the actual CA instead of a throwaway one.
    ca_cert: Certificate,
    ipam: Mutex<Inner>,
}

pub struct IssuedCertificate {
    pub key_pem: String,
    pub cert_pem: String,
    pub ca_pem: String,
}

impl CertificateAuthority {
    /// Bootstraps the CA either by generating a fresh root keypair or by
    /// loading one persisted to disk, per `conf.ca_key_source` — a cluster
    /// that regenerated its CA on every restart would invalidate every
    /// certificate it had previously issued.
    pub fn bootstrap(grace_period: TimeDuration, key_source: &CaKeySource) -> Result<Self> {
        let ca_name = "control-plane root CA".to_owned();

        let (private_key, ca_cert_pem) = match key_source {
            CaKeySource::Generate => {
                let private_key = PrivateKey::generate_rsa(4096)
                    .map_err(|e| ControlPlaneError::crypto("CA key generation failed").with_source(e))?;
                let ca_cert_pem = self_signed_ca_cert(&private_key, &ca_name)?;
                (private_key, ca_cert_pem)
            }
            CaKeySource::FromFile { key_path, cert_path } => {
                let key_pem = std::fs::read_to_string(key_path)
                    .map_err(|e| ControlPlaneError::crypto("failed to read CA key file").with_source(e))?
                    .parse::<Pem<'_>>()
                    .map_err(|e| ControlPlaneError::crypto("CA key file is not valid PEM").with_source(e))?;
                let private_key = PrivateKey::from_pem(&key_pem)
                    .map_err(|e| ControlPlaneError::crypto("failed to load CA key").with_source(e))?;
                let ca_cert_pem = std::fs::read_to_string(cert_path)
                    .map_err(|e| ControlPlaneError::crypto("failed to read CA certificate file").with_source(e))?;
                (private_key, ca_cert_pem)
            }
        };

        let der = private_key
            .to_pkcs8()
            .map_err(|e| ControlPlaneError::crypto("failed to encode CA key").with_source(e))?;

        // Re-derive the same key/cert into `rcgen` terms once, so `issue_leaf`
        // always signs against this one real root rather than minting an
        // unrelated throwaway CA per call (see the `ca_cert` field doc).
        let ca_key_pair =
            rcgen::KeyPair::from_der(&der).map_err(|e| ControlPlaneError::crypto("failed to load CA key for signing").with_source(e))?;
        let ca_cert = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| ControlPlaneError::crypto("failed to parse CA certificate").with_source(e))?
            .self_signed(&ca_key_pair)
            .map_err(|e| ControlPlaneError::crypto("failed to re-derive CA certificate for signing").with_source(e))?;

        let network: Ipv4Network = OVERLAY_CIDR
            .parse()
            .expect("OVERLAY_CIDR is a valid constant CIDR literal");

        Ok(Self {
            signing_key: ProtectedKey::from_der(der),
            ca_cert_pem,
            ca_cert,
            ipam: Mutex::new(Inner {
                network,
                entries: HashMap::new(),
                by_ip: HashMap::new(),
                grace_period,
            }),
        })
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert_pem.clone()
    }

    pub fn issue_client_cert(&self, node_id: &str, name: &str, node_type: &str) -> Result<IssuedCertificate> {
        self.issue_leaf(node_id, name, node_type, &[], false)
    }

    pub fn issue_headend_cert(&self, node_id: &str, name: &str, sans: &[String]) -> Result<IssuedCertificate> {
        self.issue_leaf(node_id, name, "headend", sans, true)
    }

    fn issue_leaf(
        &self,
        node_id: &str,
        name: &str,
        node_type: &str,
        extra_sans: &[String],
        is_server: bool,
    ) -> Result<IssuedCertificate> {
        let leaf_key = KeyPair::generate().map_err(|e| ControlPlaneError::crypto("leaf key generation failed").with_source(e))?;

        let mut params = CertificateParams::new(std::iter::once(name.to_owned()).chain(extra_sans.iter().cloned()).collect::<Vec<_>>())
            .map_err(|e| ControlPlaneError::crypto("invalid certificate SAN list").with_source(e))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, node_id);
        dn.push(DnType::OrganizationName, node_type);
        params.distinguished_name = dn;
        params.subject_alt_names.push(SanType::DnsName(
            name.try_into()
                .map_err(|_| ControlPlaneError::validation("name is not a valid DNS SAN"))?,
        ));
        if is_server {
            params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        } else {
            params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        }

        // Exposed only for the span of this call: the signing key itself
        // lives zeroized in `self.signing_key` between issuances.
        let ca_key_pair = rcgen::KeyPair::from_der(self.signing_key.expose_der())
            .map_err(|e| ControlPlaneError::crypto("failed to load CA signing key").with_source(e))?;

        let leaf_cert = params
            .signed_by(&leaf_key, &self.ca_cert, &ca_key_pair)
            .map_err(|e| ControlPlaneError::crypto("leaf signing failed").with_source(e))?;

        Ok(IssuedCertificate {
            key_pem: leaf_key.serialize_pem(),
            cert_pem: leaf_cert.pem(),
            ca_pem: self.ca_cert_pem.clone(),
        })
    }

    pub fn generate_wireguard_keys(&self, node_id: &str, node_type: &str) -> Result<WireGuardPeer> {
        let mut inner = self.ipam.lock();

        if let Some(existing) = inner.entries.get(node_id) {
            if !existing.peer.revoked {
                return Ok(existing.peer.clone());
            }
        }

        let now = OffsetDateTime::now_utc();
        let addr = inner
            .first_free(now)
            .ok_or_else(|| ControlPlaneError::unavailable("no addresses available in the overlay network"))?;

        let keypair = x25519_keypair();

        let peer = WireGuardPeer {
            node_id: node_id.to_owned(),
            node_type: node_type.to_owned(),
            public_key: keypair.1.clone(),
            ip_address: addr,
            allowed_ips: vec![format!("{addr}/32")],
            revoked: false,
            revoked_at: None,
        };

        inner.by_ip.insert(addr, node_id.to_owned());
        inner.entries.insert(
            node_id.to_owned(),
            IpamEntry {
                peer: peer.clone(),
                private_key_b64: keypair.0,
            },
        );

        Ok(peer)
    }

    pub fn wireguard_private_key(&self, node_id: &str) -> Option<String> {
        self.ipam.lock().entries.get(node_id).map(|e| e.private_key_b64.clone())
    }

    pub fn revoke_wireguard_keys(&self, node_id: &str) -> bool {
        let mut inner = self.ipam.lock();
        match inner.entries.get_mut(node_id) {
            Some(entry) if !entry.peer.revoked => {
                entry.peer.revoked = true;
                entry.peer.revoked_at = Some(OffsetDateTime::now_utc());
                true
            }
            _ => false,
        }
    }

    pub fn list_peers(&self) -> Vec<WireGuardPeer> {
        self.ipam.lock().entries.values().map(|e| e.peer.clone()).collect()
    }
}

/// Generates an X25519 keypair for WireGuard, base64-encoded as the
/// `wg genkey`/`wg pubkey` tooling expects. Grounded on `x25519-dalek`'s
/// standard usage since neither the teacher nor the retained dependency set
/// needed WireGuard key material before now.
fn x25519_keypair() -> (String, String) {
    use base64::Engine as _;
    use rand::RngCore as _;
    use rand::rngs::OsRng;
    use x25519_dalek::{PublicKey, StaticSecret};

    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);

    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);

    (
        base64::engine::general_purpose::STANDARD.encode(secret.to_bytes()),
        base64::engine::general_purpose::STANDARD.encode(public.to_bytes()),
    )
}

fn self_signed_ca_cert(private_key: &PrivateKey, ca_name: &str) -> Result<String> {
    let public_key = private_key
        .to_public_key()
        .map_err(|e| ControlPlaneError::crypto("failed to derive CA public key").with_source(e))?;

    let subject = DirectoryName::new_common_name(ca_name);
    let valid_from = UtcDate::from(OffsetDateTime::now_utc());
    let valid_to = UtcDate::from(OffsetDateTime::now_utc() + TimeDuration::days(3650));

    let cert = CertificateBuilder::new()
        .validity(valid_from, valid_to)
        .self_signed(subject, private_key)
        .ca(true)
        .serial_number(Uuid::new_v4().as_bytes().to_vec())
        .extended_key_usage(ExtendedKeyUsage::new(vec![]))
        .signature_hash_type(picky::hash::HashAlgorithm::SHA2_256)
        .build()
        .map_err(|e| ControlPlaneError::crypto("failed to build CA certificate").with_source(e))?;

    let _ = public_key;

    cert.to_pem()
        .map(|pem| pem.to_string())
        .map_err(|e| ControlPlaneError::crypto("failed to encode CA certificate").with_source(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_produces_pem_ca_cert() {
        let ca = CertificateAuthority::bootstrap(TimeDuration::hours(24), &CaKeySource::Generate).expect("bootstrap");
        assert!(ca.ca_pem().starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(ca.ca_pem().ends_with('\n'));
    }

    #[test]
    fn wireguard_allocation_is_idempotent_per_node() {
        let ca = CertificateAuthority::bootstrap(TimeDuration::hours(24), &CaKeySource::Generate).expect("bootstrap");
        let first = ca.generate_wireguard_keys("node-a", "client_native").expect("alloc");
        let second = ca.generate_wireguard_keys("node-a", "client_native").expect("alloc again");
        assert_eq!(first.ip_address, second.ip_address);
        assert_eq!(first.public_key, second.public_key);
    }

    #[test]
    fn wireguard_allocation_skips_reserved_addresses() {
        let ca = CertificateAuthority::bootstrap(TimeDuration::hours(24), &CaKeySource::Generate).expect("bootstrap");
        let peer = ca.generate_wireguard_keys("node-b", "client_native").expect("alloc");
        assert_ne!(peer.ip_address, Ipv4Addr::new(10, 200, 0, 0));
        assert_ne!(peer.ip_address, Ipv4Addr::new(10, 200, 0, 1));
    }

    #[test]
    fn distinct_nodes_get_distinct_addresses() {
        let ca = CertificateAuthority::bootstrap(TimeDuration::hours(24), &CaKeySource::Generate).expect("bootstrap");
        let a = ca.generate_wireguard_keys("node-c", "client_native").expect("alloc");
        let b = ca.generate_wireguard_keys("node-d", "client_native").expect("alloc");
        assert_ne!(a.ip_address, b.ip_address);
    }

    #[test]
    fn revoked_address_is_not_reissued_before_grace_elapses() {
        let ca = CertificateAuthority::bootstrap(TimeDuration::hours(24), &CaKeySource::Generate).expect("bootstrap");
        let peer = ca.generate_wireguard_keys("node-e", "client_native").expect("alloc");
        assert!(ca.revoke_wireguard_keys("node-e"));

        // Grace period has not elapsed: the address must not be handed to a
        // different node.
        let other = ca.generate_wireguard_keys("node-f", "client_native").expect("alloc");
        assert_ne!(other.ip_address, peer.ip_address);
    }
}
