use crate::context::TaskContext;
use crate::pipeline::{Next, Stage, TaskFault, TaskOutcome};
use anyhow::Context;
use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, Method};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use taskgate_core::{
    ResultCode, TaskTypeRegistry, TokenConstraints, TokenFailureKind, TokenVerifier,
};

/// Only accepts POSTs carrying a push token minted for this exact URL by the task type's signer.
pub struct AuthenticationStage {
    registry: Arc<TaskTypeRegistry>,
    verifier: Arc<dyn TokenVerifier>,
}

impl std::fmt::Debug for AuthenticationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationStage")
            .field("registry", &self.registry)
            .field("verifier", &"<TokenVerifier>")
            .finish()
    }
}

impl AuthenticationStage {
    pub fn new(registry: Arc<TaskTypeRegistry>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { registry, verifier }
    }

    async fn authenticate(&self, ctx: &TaskContext) -> Result<String, ResultCode> {
        if ctx.method() != Method::POST {
            return Err(ResultCode::bad_http_method(ctx.method().as_str()));
        }

        let Some(header) = ctx
            .header(AUTHORIZATION.as_str())
            .filter(|value| !value.trim().is_empty())
        else {
            return Err(ResultCode::auth_not_provided(
                "Authorization header is required",
            ));
        };
        let Some(token) = bearer_token(header) else {
            return Err(ResultCode::auth_invalid(
                "Authorization header is not a bearer token",
            ));
        };

        let signer = self
            .registry
            .get(ctx.task_type())
            .map(|config| &config.signer)
            .map_err(|err| {
                ResultCode::auth_invalid(format!("Cannot authenticate task: {err}"))
            })?;
        let Some(email) = signer.email() else {
            return Err(ResultCode::auth_invalid(
                "Task type is dispatched anonymously and cannot be authenticated",
            ));
        };

        let constraints = TokenConstraints {
            audience: ctx.full_url().to_string(),
            email: email.to_string(),
        };
        match self.verifier.verify(token, &constraints).await {
            Ok(verified) => Ok(verified.email.unwrap_or(verified.subject)),
            Err(failure) => {
                let kind = failure.kind;
                let message = format!("Token failed ({}: {failure})", kind.as_str());
                let result = if kind == TokenFailureKind::Expired {
                    ResultCode::auth_expired(message)
                } else {
                    ResultCode::auth_invalid(message)
                };
                Err(result
                    .with_context("token_failure", kind.as_str())
                    .with_context("audience", &constraints.audience)
                    .with_error(failure.into_inner()))
            }
        }
    }
}

#[async_trait]
impl Stage for AuthenticationStage {
    async fn handle(&self, ctx: &mut TaskContext, next: Next<'_>) -> TaskOutcome {
        let email = match self.authenticate(ctx).await {
            Ok(email) => email,
            Err(result) => return Ok(result),
        };
        ctx.set_caller_email(email)
            .context("record authenticated caller")
            .map_err(TaskFault::Unexpected)?;
        next.run(ctx).await
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    static BEARER: OnceLock<Option<Regex>> = OnceLock::new();
    BEARER
        .get_or_init(|| Regex::new(r"^Bearer (.+)$").ok())
        .as_ref()?
        .captures(header)
        .and_then(|caps| caps.get(1))
        .map(|token| token.as_str().trim())
        .filter(|token| !token.is_empty())
}
