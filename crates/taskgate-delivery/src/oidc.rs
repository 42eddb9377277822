//! Verification of queue-minted OIDC push tokens against a JWKS endpoint.

use async_trait::async_trait;
use jsonwebtoken::{
    decode, decode_header,
    jwk::{Jwk, JwkSet},
    Algorithm, DecodingKey, Validation,
};
use std::time::Duration;
use taskgate_core::{
    lite::jwt::check_email, OidcClaims, TokenConstraints, TokenFailure, TokenFailureKind,
    TokenVerifier, VerifiedToken,
};
use tokio::{sync::RwLock, time::Instant};

struct CachedKeys {
    fetched_at: Instant,
    keys: JwkSet,
}

pub struct OidcTokenVerifier {
    http: reqwest::Client,
    jwks_url: String,
    issuer: String,
    cache_ttl: Duration,
    cache: RwLock<Option<CachedKeys>>,
}

impl std::fmt::Debug for OidcTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcTokenVerifier")
            .field("jwks_url", &self.jwks_url)
            .field("issuer", &self.issuer)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl OidcTokenVerifier {
    pub fn new(
        http: reqwest::Client,
        jwks_url: impl Into<String>,
        issuer: impl Into<String>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            http,
            jwks_url: jwks_url.into(),
            issuer: issuer.into(),
            cache_ttl,
            cache: RwLock::new(None),
        }
    }

    /// Key for `kid`, refetching the key set once when it is stale or does not know the kid
    /// (signing keys rotate).
    async fn key(&self, kid: &str) -> Result<Jwk, TokenFailure> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    if let Some(jwk) = cached.keys.find(kid) {
                        return Ok(jwk.clone());
                    }
                }
            }
        }

        let keys = self.fetch_keys().await?;
        let jwk = keys.find(kid).cloned();
        *self.cache.write().await = Some(CachedKeys {
            fetched_at: Instant::now(),
            keys,
        });
        jwk.ok_or_else(|| {
            TokenFailure::msg(
                TokenFailureKind::UnknownKey,
                format!("no signing key with kid `{kid}`"),
            )
        })
    }

    async fn fetch_keys(&self) -> Result<JwkSet, TokenFailure> {
        let fetch_failed = |err: reqwest::Error| {
            tracing::warn!(
                event = "delivery.oidc.jwks_fetch_failed",
                url = %self.jwks_url,
                error = %err,
                "failed to fetch signing keys"
            );
            TokenFailure::new(TokenFailureKind::KeyFetchFailed, anyhow::Error::from(err))
        };
        let keys = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(fetch_failed)?
            .json::<JwkSet>()
            .await
            .map_err(fetch_failed)?;
        tracing::debug!(
            event = "delivery.oidc.jwks_fetched",
            keys = keys.keys.len(),
            "fetched signing keys"
        );
        Ok(keys)
    }
}

#[async_trait]
impl TokenVerifier for OidcTokenVerifier {
    async fn verify(
        &self,
        token: &str,
        constraints: &TokenConstraints,
    ) -> Result<VerifiedToken, TokenFailure> {
        let header = decode_header(token).map_err(TokenFailure::from_jwt)?;
        if header.alg != Algorithm::RS256 {
            return Err(TokenFailure::msg(
                TokenFailureKind::Malformed,
                format!("unexpected jwt alg {:?}", header.alg),
            ));
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| TokenFailure::msg(TokenFailureKind::Malformed, "missing jwt kid"))?;

        let jwk = self.key(kid).await?;
        let decoding_key = DecodingKey::from_jwk(&jwk).map_err(TokenFailure::from_jwt)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_audience(std::slice::from_ref(&constraints.audience));

        let data = decode::<OidcClaims>(token, &decoding_key, &validation)
            .map_err(TokenFailure::from_jwt)?;
        check_email(&data.claims, &constraints.email)?;
        Ok(VerifiedToken {
            email: data.claims.email,
            subject: data.claims.sub,
        })
    }
}
