//! End-to-end handling of one generation request.
//!
//! Stages run strictly in order: rate limit, sanitize, validate, build the
//! prompt, check the token budget, call the completion service, extract the
//! result.  Any stage may end the request early.  Whatever the exit, exactly
//! one audit record is written before the outcome is returned.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;

use crate::audit::{AuditLogger, AuditRecord};
use crate::completion::CompletionClient;
use crate::config::GeneratorConfig;
use crate::error::GenerationError;
use crate::extract::extract;
use crate::prompts::{self, PromptContext};
use crate::rate_limit::RateLimiter;
use crate::sanitize::Sanitizer;
use crate::tokens;
use crate::{CallerIdentity, GenerationRequest, GenerationResult, Level};

/// Rate-limit endpoint key for this pipeline.
pub const ENDPOINT: &str = "generate-story";

/// Transport details recorded alongside the request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// A successful generation.
#[derive(Debug, Clone)]
pub struct Generated {
    pub data: GenerationResult,
    pub level: Level,
    pub token_count: usize,
    pub execution_time_ms: u64,
}

pub struct GenerationPipeline {
    config: GeneratorConfig,
    sanitizer: Sanitizer,
    limiter: RateLimiter,
    client: Arc<dyn CompletionClient>,
    audit: AuditLogger,
}

impl GenerationPipeline {
    pub fn new(
        config: GeneratorConfig,
        limiter: RateLimiter,
        client: Arc<dyn CompletionClient>,
        audit: AuditLogger,
    ) -> Self {
        let sanitizer = Sanitizer::new(
            config.max_input_chars,
            config.extra_injection_signatures.clone(),
        );
        Self {
            config,
            sanitizer,
            limiter,
            client,
            audit,
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn handle(
        &self,
        request: GenerationRequest,
        identity: &CallerIdentity,
        meta: &RequestMeta,
    ) -> Result<Generated, GenerationError> {
        let started = Instant::now();
        let level = request.story_level;
        let mut token_count = 0;

        let admitted = self.admit(identity).await;
        let sanitized = self.sanitizer.sanitize_request(request);
        let result = match admitted {
            Ok(()) => self.generate(&sanitized, &mut token_count).await,
            Err(err) => Err(err),
        };
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let (user_id, is_anonymous) = match identity {
            CallerIdentity::Authenticated { user_id } => (Some(user_id.clone()), false),
            CallerIdentity::Anonymous { .. } => (None, true),
        };
        let record = AuditRecord {
            user_id,
            is_anonymous,
            story_level: level,
            input_data: serde_json::to_value(&sanitized).unwrap_or(Value::Null),
            output_data: result.as_ref().ok().cloned(),
            token_count,
            execution_time_ms,
            success: result.is_ok(),
            error_message: result.as_ref().err().map(ToString::to_string),
            ip_address: meta.ip_address.clone(),
            user_agent: meta.user_agent.clone(),
            created_at: Utc::now(),
        };
        self.audit.record(&record).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.kind().as_str(),
        };
        tracing::info!(
            target: "generation",
            level = %level,
            outcome,
            anonymous = is_anonymous,
            token_count,
            latency_ms = execution_time_ms,
            "generation request finished"
        );

        result.map(|data| Generated {
            data,
            level,
            token_count,
            execution_time_ms,
        })
    }

    async fn admit(&self, identity: &CallerIdentity) -> Result<(), GenerationError> {
        let decision = self
            .limiter
            .check_and_consume(identity, ENDPOINT)
            .await
            .map_err(|err| {
                tracing::error!(target: "rate_limit", error = %err, "rate limit check failed");
                GenerationError::Internal(err.to_string())
            })?;
        if decision.allowed {
            return Ok(());
        }
        Err(GenerationError::RateLimited {
            policy: decision.policy,
            limit: decision.limit,
            window: decision.window,
            retry_after: decision.retry_after,
        })
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        token_count: &mut usize,
    ) -> Result<GenerationResult, GenerationError> {
        validate(request, &self.config)?;

        let ctx = PromptContext::from_request(request);
        let prompt = prompts::build(&ctx);
        let budget = tokens::validate_budget(&prompt.combined(), self.config.max_prompt_tokens);
        *token_count = budget.token_count;
        if !budget.valid {
            return Err(GenerationError::BudgetExceeded {
                estimated: budget.token_count,
                ceiling: self.config.max_prompt_tokens,
            });
        }

        let raw = self
            .client
            .complete(
                &prompt.system_prompt,
                &prompt.user_prompt,
                self.config.max_output_tokens,
                self.config.temperature,
            )
            .await?;
        let data = extract(&raw).inspect_err(|err| {
            tracing::warn!(target: "generation", level = %ctx.level, error = %err, "could not recover JSON from completion");
        })?;

        let problems = prompts::check_shape(ctx.level, &data);
        if !problems.is_empty() {
            tracing::warn!(
                target: "generation",
                level = %ctx.level,
                problems = ?problems,
                "generated result is missing expected fields"
            );
        }
        Ok(data)
    }
}

/// Field and parent checks on a sanitized request.
pub fn validate(request: &GenerationRequest, config: &GeneratorConfig) -> Result<(), GenerationError> {
    let input = request.user_input.trim();
    if input.is_empty() {
        return Err(GenerationError::Validation("User input is required".into()));
    }
    if input.chars().count() < config.min_input_chars {
        return Err(GenerationError::Validation(format!(
            "User input must be at least {} characters",
            config.min_input_chars
        )));
    }

    let level = request.story_level;
    let Some(parent_level) = level.parent() else {
        return Ok(());
    };
    let has_parent = request
        .parent_id
        .as_deref()
        .is_some_and(|id| !id.trim().is_empty());
    if !has_parent {
        return Err(GenerationError::Validation(format!(
            "Parent {} is required for {}-level generation",
            parent_level, level
        )));
    }
    if let Some(pc) = &request.parent_context {
        if pc.level != parent_level {
            return Err(GenerationError::Validation(format!(
                "Parent context must describe a {} for {}-level generation (got {})",
                parent_level, level, pc.level
            )));
        }
    }
    Ok(())
}
