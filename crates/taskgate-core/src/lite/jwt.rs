use crate::{
    Error, OidcClaims, Result, TokenConstraints, TokenFailure, TokenFailureKind, TokenVerifier,
    VerifiedToken,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use std::time::Duration;

#[derive(Clone)]
pub struct Hs256TokenConfig {
    pub issuer: String,
    pub current_kid: String,
    pub current_secret: String,
    pub next_kid: Option<String>,
    pub next_secret: Option<String>,
    pub ttl: Duration,
}

impl std::fmt::Debug for Hs256TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let next_secret = self.next_secret.as_deref().map(|_| "<redacted>");
        f.debug_struct("Hs256TokenConfig")
            .field("issuer", &self.issuer)
            .field("current_kid", &self.current_kid)
            .field("current_secret", &"<redacted>")
            .field("next_kid", &self.next_kid)
            .field("next_secret", &next_secret)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Mints and verifies OIDC-shaped push tokens with a shared secret.
///
/// Stands in for the queue service's token minting and the OIDC verifier when running locally.
#[derive(Clone)]
pub struct Hs256TokenAuthority {
    issuer: String,
    current_kid: String,
    next_kid: Option<String>,
    ttl: Duration,
    current_encoding_key: EncodingKey,
    current_decoding_key: DecodingKey,
    next_decoding_key: Option<DecodingKey>,
}

impl std::fmt::Debug for Hs256TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let next_decoding_key = self.next_decoding_key.as_ref().map(|_| "<redacted>");
        f.debug_struct("Hs256TokenAuthority")
            .field("issuer", &self.issuer)
            .field("current_kid", &self.current_kid)
            .field("next_kid", &self.next_kid)
            .field("ttl", &self.ttl)
            .field("current_encoding_key", &"<redacted>")
            .field("current_decoding_key", &"<redacted>")
            .field("next_decoding_key", &next_decoding_key)
            .finish()
    }
}

impl Hs256TokenAuthority {
    pub fn from_config(cfg: Hs256TokenConfig) -> Result<Self> {
        if cfg.next_kid.is_some() != cfg.next_secret.is_some() {
            return Err(Error::configuration(
                "next_kid and next_secret must be set together",
            ));
        }

        let secret = cfg.current_secret.as_bytes();
        Ok(Self {
            issuer: cfg.issuer,
            current_kid: cfg.current_kid,
            next_kid: cfg.next_kid,
            ttl: cfg.ttl,
            current_encoding_key: EncodingKey::from_secret(secret),
            current_decoding_key: DecodingKey::from_secret(secret),
            next_decoding_key: cfg
                .next_secret
                .as_deref()
                .map(|s| DecodingKey::from_secret(s.as_bytes())),
        })
    }

    /// Token for `email` bound to `audience` (the exact URL the task will be pushed to).
    pub fn issue(&self, email: &str, audience: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        self.issue_at(email, audience, now)
    }

    pub fn issue_at(&self, email: &str, audience: &str, issued_at: i64) -> Result<String> {
        let iat: usize = issued_at.try_into().unwrap_or(0);
        let exp: usize = (issued_at + self.ttl.as_secs().try_into().unwrap_or(i64::MAX))
            .try_into()
            .unwrap_or(usize::MAX);

        let claims = OidcClaims {
            iss: self.issuer.clone(),
            aud: audience.to_string(),
            sub: email.to_string(),
            exp,
            iat,
            email: Some(email.to_string()),
            email_verified: Some(true),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.current_kid.clone());
        encode(&header, &claims, &self.current_encoding_key)
            .context("encode push token")
            .map_err(Error::from)
    }

    pub fn verify_claims(
        &self,
        token: &str,
        constraints: &TokenConstraints,
    ) -> std::result::Result<OidcClaims, TokenFailure> {
        let header = decode_header(token).map_err(TokenFailure::from_jwt)?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| TokenFailure::msg(TokenFailureKind::Malformed, "missing jwt kid"))?;

        let decoding_key = if kid == self.current_kid {
            &self.current_decoding_key
        } else if self.next_kid.as_deref() == Some(kid) {
            self.next_decoding_key.as_ref().ok_or_else(|| {
                TokenFailure::msg(TokenFailureKind::UnknownKey, "next jwt key not configured")
            })?
        } else {
            return Err(TokenFailure::msg(
                TokenFailureKind::UnknownKey,
                format!("unknown jwt kid `{kid}`"),
            ));
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_audience(std::slice::from_ref(&constraints.audience));

        let data =
            decode::<OidcClaims>(token, decoding_key, &validation).map_err(TokenFailure::from_jwt)?;
        check_email(&data.claims, &constraints.email)?;
        Ok(data.claims)
    }
}

/// Signer email must match exactly and, when the claim is present, be verified.
pub fn check_email(claims: &OidcClaims, expected: &str) -> std::result::Result<(), TokenFailure> {
    match claims.email.as_deref() {
        Some(email) if email == expected => {}
        Some(email) => {
            return Err(TokenFailure::msg(
                TokenFailureKind::EmailMismatch,
                format!("token email `{email}` does not match `{expected}`"),
            ));
        }
        None => {
            return Err(TokenFailure::msg(
                TokenFailureKind::EmailMismatch,
                "token has no email claim",
            ));
        }
    }
    if claims.email_verified == Some(false) {
        return Err(TokenFailure::msg(
            TokenFailureKind::EmailMismatch,
            "token email is not verified",
        ));
    }
    Ok(())
}

#[async_trait]
impl TokenVerifier for Hs256TokenAuthority {
    async fn verify(
        &self,
        token: &str,
        constraints: &TokenConstraints,
    ) -> std::result::Result<VerifiedToken, TokenFailure> {
        let claims = self.verify_claims(token, constraints)?;
        Ok(VerifiedToken {
            email: claims.email,
            subject: claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNER: &str = "tasks@my-project.iam.gserviceaccount.com";
    const URL: &str = "https://app.example.com/_do_task/send-invoice?id=15";

    fn authority(kid: &str, secret: &str) -> Hs256TokenAuthority {
        Hs256TokenAuthority::from_config(Hs256TokenConfig {
            issuer: "https://accounts.google.com".to_string(),
            current_kid: kid.to_string(),
            current_secret: secret.to_string(),
            next_kid: None,
            next_secret: None,
            ttl: Duration::from_secs(300),
        })
        .expect("authority")
    }

    fn constraints(audience: &str, email: &str) -> TokenConstraints {
        TokenConstraints {
            audience: audience.to_string(),
            email: email.to_string(),
        }
    }

    #[test]
    fn issued_token_verifies_for_exact_url_and_signer() {
        let auth = authority("dev", "secret");
        let token = auth.issue(SIGNER, URL).expect("issue");
        let claims = auth
            .verify_claims(&token, &constraints(URL, SIGNER))
            .expect("verify");
        assert_eq!(claims.email.as_deref(), Some(SIGNER));
        assert_eq!(claims.aud, URL);
    }

    #[test]
    fn other_url_is_audience_mismatch() {
        let auth = authority("dev", "secret");
        let token = auth.issue(SIGNER, URL).expect("issue");
        let err = auth
            .verify_claims(
                &token,
                &constraints("https://app.example.com/_do_task/other", SIGNER),
            )
            .expect_err("audience");
        assert_eq!(err.kind, TokenFailureKind::AudienceMismatch);
    }

    #[test]
    fn other_signer_is_email_mismatch() {
        let auth = authority("dev", "secret");
        let token = auth.issue("someone@else.com", URL).expect("issue");
        let err = auth
            .verify_claims(&token, &constraints(URL, SIGNER))
            .expect_err("email");
        assert_eq!(err.kind, TokenFailureKind::EmailMismatch);
    }

    #[test]
    fn old_token_is_expired() {
        let auth = authority("dev", "secret");
        let token = auth
            .issue_at(SIGNER, URL, Utc::now().timestamp() - 3600)
            .expect("issue");
        let err = auth
            .verify_claims(&token, &constraints(URL, SIGNER))
            .expect_err("expired");
        assert_eq!(err.kind, TokenFailureKind::Expired);
    }

    #[test]
    fn unknown_kid_and_garbage_are_rejected() {
        let token = authority("other", "secret")
            .issue(SIGNER, URL)
            .expect("issue");
        let err = authority("dev", "secret")
            .verify_claims(&token, &constraints(URL, SIGNER))
            .expect_err("kid");
        assert_eq!(err.kind, TokenFailureKind::UnknownKey);

        let err = authority("dev", "secret")
            .verify_claims("not-a-jwt", &constraints(URL, SIGNER))
            .expect_err("garbage");
        assert_eq!(err.kind, TokenFailureKind::Malformed);
    }

    #[test]
    fn rotation_accepts_next_key() {
        let next = authority("next", "next-secret");
        let token = next.issue(SIGNER, URL).expect("issue");

        let rotating = Hs256TokenAuthority::from_config(Hs256TokenConfig {
            issuer: "https://accounts.google.com".to_string(),
            current_kid: "dev".to_string(),
            current_secret: "secret".to_string(),
            next_kid: Some("next".to_string()),
            next_secret: Some("next-secret".to_string()),
            ttl: Duration::from_secs(300),
        })
        .expect("authority");
        rotating
            .verify_claims(&token, &constraints(URL, SIGNER))
            .expect("verify with next key");
    }
}
