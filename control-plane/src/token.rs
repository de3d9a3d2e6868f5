//! RS256 JWT issuance, validation, refresh and revocation.
//!
//! Every non-enrollment request is authenticated against a token minted
//! here. The signing key lives for the whole process and is held through
//! [`crate::crypto::master_key::ProtectedKey`]; the cache (Redis) is the
//! sole authority on whether a given `jti` is still active — a valid
//! signature with no cache entry is rejected (§4.2).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use control_plane_task::{ShutdownSignal, Task};
use picky::jose::jws::RawJws;
use picky::jose::jwt::{CheckedJwtSig, JwsAlg, JwtValidator};
use picky::key::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::master_key::ProtectedKey;
use crate::error::{ControlPlaneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// The signed claims carried by every token, matching the bit-exact format
/// in SPEC_FULL.md §6: `sub`, `node_type`, `permissions`, `iat`/`exp` as Unix
/// seconds, a UUID `jti`, optional free-form `metadata`, and `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub node_type: String,
    pub permissions: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AccessClaims {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Metadata the cache keeps about a `jti`, the sole proof of *current*
/// validity (the signature alone only proves *authenticity*).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub node_id: String,
    pub node_type: String,
    pub permissions: Vec<String>,
    pub kind: TokenKind,
    pub expires_at: i64,
    pub active: bool,
}

pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
}

/// Cache backend abstraction so the token service can be exercised in tests
/// without a live Redis instance; [`crate::redis_backend::RedisCache`] is the
/// production implementation.
#[async_trait]
pub trait TokenCacheBackend: Send + Sync {
    async fn put(&self, jti: Uuid, metadata: &TokenMetadata, ttl_secs: u64) -> anyhow::Result<()>;
    async fn get(&self, jti: Uuid) -> anyhow::Result<Option<TokenMetadata>>;
    async fn mark_inactive(&self, jti: Uuid) -> anyhow::Result<bool>;
    async fn index_for_owner(&self, node_id: &str, jti: Uuid) -> anyhow::Result<()>;
    async fn owned_by(&self, node_id: &str) -> anyhow::Result<HashSet<Uuid>>;
    async fn purge_expired(&self) -> anyhow::Result<u64>;
}

pub struct TokenServiceConfig {
    pub access_lifetime_secs: i64,
    pub refresh_lifetime_secs: i64,
    /// When the cache is unreachable, issuance normally fails closed
    /// (§7: "fails open on issuance only if explicitly configured").
    pub fail_open_on_issuance: bool,
}

impl Default for TokenServiceConfig {
    fn default() -> Self {
        Self {
            access_lifetime_secs: 24 * 3600,
            refresh_lifetime_secs: 7 * 24 * 3600,
            fail_open_on_issuance: false,
        }
    }
}

pub struct TokenService {
    signing_key: ProtectedKey,
    public_key: PublicKey,
    cache: Arc<dyn TokenCacheBackend>,
    config: TokenServiceConfig,
}

impl TokenService {
    /// Generates a fresh in-process RSA 2048 keypair, matching
    /// `original_source/manager/auth/jwt_manager.py::_generate_rsa_keys`.
    pub fn generate_keypair(cache: Arc<dyn TokenCacheBackend>, config: TokenServiceConfig) -> Result<Self> {
        let private_key =
            PrivateKey::generate_rsa(2048).map_err(|e| ControlPlaneError::crypto("RSA key generation failed").with_source(e))?;
        Self::from_private_key(private_key, cache, config)
    }

    pub fn from_private_key(
        private_key: PrivateKey,
        cache: Arc<dyn TokenCacheBackend>,
        config: TokenServiceConfig,
    ) -> Result<Self> {
        let public_key = private_key
            .to_public_key()
            .map_err(|e| ControlPlaneError::crypto("failed to derive public key").with_source(e))?;
        let der = private_key
            .to_pkcs8()
            .map_err(|e| ControlPlaneError::crypto("failed to encode private key").with_source(e))?;

        Ok(Self {
            signing_key: ProtectedKey::from_der(der),
            public_key,
            cache,
            config,
        })
    }

    /// PEM-encoded public key, exposed via `GET /api/v1/auth/public-key` so
    /// headends can verify tokens without calling back into this service.
    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_pem()
            .map(|pem| pem.to_string())
            .map_err(|e| ControlPlaneError::crypto("failed to encode public key").with_source(e))
    }

    pub async fn generate(
        &self,
        node_id: &str,
        node_type: &str,
        permissions: Vec<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<IssuedTokens> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let access_exp = now + self.config.access_lifetime_secs;
        let refresh_exp = now + self.config.refresh_lifetime_secs;

        let access_jti = Uuid::new_v4();
        let refresh_jti = Uuid::new_v4();

        let access_claims = AccessClaims {
            sub: node_id.to_owned(),
            node_type: node_type.to_owned(),
            permissions: permissions.clone(),
            iat: now,
            exp: access_exp,
            jti: access_jti,
            kind: TokenKind::Access,
            metadata: metadata.clone(),
        };

        let refresh_claims = AccessClaims {
            sub: node_id.to_owned(),
            node_type: node_type.to_owned(),
            permissions: permissions.clone(),
            iat: now,
            exp: refresh_exp,
            jti: refresh_jti,
            kind: TokenKind::Refresh,
            metadata: None,
        };

        let access_token = self.sign(&access_claims)?;
        let refresh_token = self.sign(&refresh_claims)?;

        let access_meta = TokenMetadata {
            node_id: node_id.to_owned(),
            node_type: node_type.to_owned(),
            permissions: permissions.clone(),
            kind: TokenKind::Access,
            expires_at: access_exp,
            active: true,
        };
        let refresh_meta = TokenMetadata {
            node_id: node_id.to_owned(),
            node_type: node_type.to_owned(),
            permissions,
            kind: TokenKind::Refresh,
            expires_at: refresh_exp,
            active: true,
        };

        let cache_result = async {
            self.cache
                .put(access_jti, &access_meta, self.config.access_lifetime_secs.max(0) as u64)
                .await?;
            self.cache
                .put(refresh_jti, &refresh_meta, self.config.refresh_lifetime_secs.max(0) as u64)
                .await?;
            self.cache.index_for_owner(node_id, access_jti).await?;
            self.cache.index_for_owner(node_id, refresh_jti).await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = cache_result {
            if !self.config.fail_open_on_issuance {
                return Err(ControlPlaneError::cache("token cache unavailable during issuance").with_source(e));
            }
            tracing::warn!(error = %e, "issuing token despite cache failure (fail-open configured)");
        }

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            expires_at: access_exp,
        })
    }

    fn sign(&self, claims: &AccessClaims) -> Result<String> {
        let private_key = self
            .signing_key
            .to_picky_private_key()
            .map_err(|e| ControlPlaneError::crypto("failed to load signing key").with_source(e))?;

        CheckedJwtSig::new(JwsAlg::RS256, claims.clone())
            .encode(&private_key)
            .map_err(|e| ControlPlaneError::crypto("failed to sign token").with_source(e))
    }

    /// Parses without verifying to recover the `jti`, mirroring the
    /// teacher's `extract_jti` helper in `token.rs`.
    fn unverified_jti(token: &str) -> Result<Uuid> {
        let jws = RawJws::decode(token)
            .map_err(|e| ControlPlaneError::authentication("malformed token").with_source(e))?
            .discard_signature();
        let payload: serde_json::Value = serde_json::from_slice(&jws.payload)
            .map_err(|e| ControlPlaneError::authentication("malformed token payload").with_source(e))?;
        let jti = payload
            .get("jti")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ControlPlaneError::authentication("token is missing jti"))?;
        Uuid::parse_str(jti).map_err(|e| ControlPlaneError::authentication("jti is not a valid UUID").with_source(e))
    }

    pub async fn validate(&self, token: &str) -> Result<AccessClaims> {
        let jti = Self::unverified_jti(token)?;

        // Cache is checked first: revocation is canonical, a valid
        // signature with no active cache entry is rejected (§4.2).
        let metadata = self
            .cache
            .get(jti)
            .await
            .map_err(|e| ControlPlaneError::cache("token cache unreachable").with_source(e))?;

        let Some(metadata) = metadata else {
            return Err(ControlPlaneError::authentication("token is unknown or has been revoked"));
        };

        if !metadata.active {
            return Err(ControlPlaneError::authentication("token has been revoked"));
        }

        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let checked = RawJws::decode(token)
            .map_err(|e| ControlPlaneError::authentication("malformed token").with_source(e))?
            .verify(&self.public_key)
            .map_err(|e| ControlPlaneError::authentication("signature verification failed").with_source(e))?;

        // Signature only here: expiry is checked by hand below so an expired
        // token marks its cache entry inactive instead of just failing this
        // one request.
        let claims: AccessClaims = picky::jose::jwt::JwtSig::from(checked)
            .validate::<AccessClaims>(&JwtValidator::no_check())
            .map(|c| c.state.claims)
            .map_err(|e| ControlPlaneError::authentication("token is malformed").with_source(e))?;

        if claims.exp <= now {
            let _ = self.cache.mark_inactive(jti).await;
            return Err(ControlPlaneError::authentication("token has expired"));
        }

        Ok(claims)
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedTokens> {
        let claims = self.validate(refresh_token).await?;

        if claims.kind != TokenKind::Refresh {
            return Err(ControlPlaneError::authentication("not a refresh token"));
        }

        self.generate(&claims.sub, &claims.node_type, claims.permissions, claims.metadata)
            .await
    }

    pub async fn revoke(&self, jti: Uuid) -> Result<bool> {
        self.cache
            .mark_inactive(jti)
            .await
            .map_err(|e| ControlPlaneError::cache("failed to revoke token").with_source(e))
    }

    pub async fn revoke_all(&self, node_id: &str) -> Result<usize> {
        let jtis = self
            .cache
            .owned_by(node_id)
            .await
            .map_err(|e| ControlPlaneError::cache("failed to enumerate tokens for node").with_source(e))?;

        let mut revoked = 0usize;
        for jti in jtis {
            if self
                .cache
                .mark_inactive(jti)
                .await
                .map_err(|e| ControlPlaneError::cache("failed to revoke token").with_source(e))?
            {
                revoked += 1;
            }
        }

        Ok(revoked)
    }
}

/// Background pass deleting cache entries past their TTL, mirroring
/// `original_source/manager/auth/jwt_manager.py::cleanup_expired_tokens`.
/// With Redis this is mostly redundant (keys carry their own TTL) but is
/// kept as a defensive sweep, matching the source's own behavior, and is
/// the only implementation for an in-memory cache backend in tests.
pub struct TokenCleanupTask {
    pub cache: Arc<dyn TokenCacheBackend>,
}

#[async_trait]
impl Task for TokenCleanupTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "token cache cleanup";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        use tokio::time::{Duration, sleep};

        const INTERVAL: Duration = Duration::from_secs(15 * 60);

        loop {
            tokio::select! {
                _ = sleep(INTERVAL) => {}
                _ = shutdown_signal.wait() => break,
            }

            match self.cache.purge_expired().await {
                Ok(count) if count > 0 => tracing::info!(count, "cleaned up expired tokens"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "token cleanup pass failed"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as StdMutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct InMemoryCache {
        entries: StdMutex<HashMap<Uuid, TokenMetadata>>,
        owners: StdMutex<HashMap<String, HashSet<Uuid>>>,
    }

    #[async_trait]
    impl TokenCacheBackend for InMemoryCache {
        async fn put(&self, jti: Uuid, metadata: &TokenMetadata, _ttl_secs: u64) -> anyhow::Result<()> {
            self.entries.lock().insert(jti, metadata.clone());
            Ok(())
        }

        async fn get(&self, jti: Uuid) -> anyhow::Result<Option<TokenMetadata>> {
            Ok(self.entries.lock().get(&jti).cloned())
        }

        async fn mark_inactive(&self, jti: Uuid) -> anyhow::Result<bool> {
            let mut guard = self.entries.lock();
            if let Some(meta) = guard.get_mut(&jti) {
                meta.active = false;
                Ok(true)
            } else {
                Ok(false)
            }
        }

        async fn index_for_owner(&self, node_id: &str, jti: Uuid) -> anyhow::Result<()> {
            self.owners.lock().entry(node_id.to_owned()).or_default().insert(jti);
            Ok(())
        }

        async fn owned_by(&self, node_id: &str) -> anyhow::Result<HashSet<Uuid>> {
            Ok(self.owners.lock().get(node_id).cloned().unwrap_or_default())
        }

        async fn purge_expired(&self) -> anyhow::Result<u64> {
            let now = time::OffsetDateTime::now_utc().unix_timestamp();
            let mut guard = self.entries.lock();
            let before = guard.len();
            guard.retain(|_, meta| meta.expires_at > now);
            Ok((before - guard.len()) as u64)
        }
    }

    fn service() -> TokenService {
        let cache = Arc::new(InMemoryCache::default());
        TokenService::generate_keypair(cache, TokenServiceConfig::default()).expect("keygen")
    }

    #[tokio::test]
    async fn issue_and_validate_roundtrip() {
        let svc = service();
        let issued = svc
            .generate("node-1", "client_native", vec!["connect".into()], None)
            .await
            .expect("issue");

        let claims = svc.validate(&issued.access_token).await.expect("validate");
        assert_eq!(claims.sub, "node-1");
        assert!(claims.has_permission("connect"));
    }

    #[tokio::test]
    async fn revoked_token_fails_validation_immediately() {
        let svc = service();
        let issued = svc.generate("node-2", "client_docker", vec![], None).await.expect("issue");

        let claims = svc.validate(&issued.access_token).await.expect("validate before revoke");
        svc.revoke(claims.jti).await.expect("revoke");

        assert!(svc.validate(&issued.access_token).await.is_err());
    }

    #[tokio::test]
    async fn revoke_all_invalidates_every_token_for_node() {
        let svc = service();

        let t1 = svc.generate("node-3", "client_native", vec![], None).await.unwrap();
        let t2 = svc.generate("node-3", "client_native", vec![], None).await.unwrap();
        let t3 = svc.generate("node-3", "client_native", vec![], None).await.unwrap();

        let revoked = svc.revoke_all("node-3").await.expect("revoke_all");
        assert_eq!(revoked, 6); // 3 access + 3 refresh jtis indexed

        assert!(svc.validate(&t1.access_token).await.is_err());
        assert!(svc.validate(&t2.access_token).await.is_err());
        assert!(svc.validate(&t3.access_token).await.is_err());
    }

    #[tokio::test]
    async fn expired_token_marks_its_cache_entry_inactive() {
        let cache = Arc::new(InMemoryCache::default());
        let svc = TokenService::generate_keypair(
            cache.clone(),
            TokenServiceConfig {
                access_lifetime_secs: -10,
                ..TokenServiceConfig::default()
            },
        )
        .expect("keygen");

        let issued = svc.generate("node-5", "client_native", vec![], None).await.unwrap();

        let err = svc.validate(&issued.access_token).await.expect_err("token is already expired");
        assert!(err.to_string().contains("expired"));

        let jti = TokenService::unverified_jti(&issued.access_token).expect("jti");
        let metadata = cache.get(jti).await.unwrap().expect("cache entry still present");
        assert!(!metadata.active, "expiry must mark the cache entry inactive");
    }

    #[tokio::test]
    async fn refresh_requires_refresh_kind() {
        let svc = service();
        let issued = svc.generate("node-4", "client_native", vec![], None).await.unwrap();

        // Using the access token as a refresh token must fail.
        assert!(svc.refresh(&issued.access_token).await.is_err());

        let refreshed = svc.refresh(&issued.refresh_token).await.expect("refresh");
        let claims = svc.validate(&refreshed.access_token).await.expect("validate new token");
        assert_eq!(claims.sub, "node-4");
    }
}
