//! Decomposition collaborator contract.
//!
//! Turning a spoken instruction into primitive calls happens outside this crate. The
//! pipeline only depends on the [`Decomposer`] trait. Two implementations live here:
//!
//! - [`StaticDecomposer`]: a precomputed plan (or a fixed failure), used when the caller
//!   already ran decomposition and for tests.
//! - [`FallbackChain`]: text-completion providers tried in order, each with retries, backoff
//!   and a rising sampling temperature. Every answer is parsed and checked against the scene
//!   before it is accepted.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::DecompositionError;
use crate::primitives::{ActionId, ActionInvocation, Params};
use crate::scene::SceneState;

/// Everything a decomposer gets to look at.
#[derive(Debug, Clone, Serialize)]
pub struct DecompositionRequest {
    pub transcript: String,
    pub scene: SceneState,
    pub scene_description: String,
    /// Sampling temperature for providers that use one.
    pub temperature: f64,
}

impl DecompositionRequest {
    pub fn new(transcript: impl Into<String>, scene: SceneState, scene_description: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            scene,
            scene_description: scene_description.into(),
            temperature: RetryPolicy::BASE_TEMPERATURE,
        }
    }
}

/// Produces an ordered action plan for a transcript.
#[async_trait]
pub trait Decomposer: Send + Sync {
    fn name(&self) -> &str;

    async fn decompose(&self, request: &DecompositionRequest) -> Result<Vec<ActionInvocation>, DecompositionError>;
}

/// A raw text-completion backend (hosted model, local runtime).
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the provider's raw answer, expected to contain a JSON action list.
    async fn complete(&self, request: &DecompositionRequest) -> Result<String, DecompositionError>;
}

/// Returns a fixed result, optionally after a delay.
#[derive(Debug, Clone)]
pub struct StaticDecomposer {
    result: Result<Vec<ActionInvocation>, DecompositionError>,
    delay: Option<Duration>,
}

impl StaticDecomposer {
    pub fn new(actions: Vec<ActionInvocation>) -> Self {
        Self {
            result: Ok(actions),
            delay: None,
        }
    }

    /// A decomposer that always reports no provider available.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            result: Err(DecompositionError::Unavailable(reason.into())),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Decomposer for StaticDecomposer {
    fn name(&self) -> &str {
        "static"
    }

    async fn decompose(&self, _request: &DecompositionRequest) -> Result<Vec<ActionInvocation>, DecompositionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}

/// Per-provider retry behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Backoff before the second attempt; doubles after each provider failure.
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub const BASE_TEMPERATURE: f64 = 0.1;
    pub const TEMPERATURE_STEP: f64 = 0.15;

    /// 0.1, 0.25, 0.4, ...
    pub fn temperature(&self, attempt: u32) -> f64 {
        Self::BASE_TEMPERATURE + Self::TEMPERATURE_STEP * f64::from(attempt)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Tries each provider in order until one yields a plan that fits the scene.
#[derive(Clone)]
pub struct FallbackChain {
    providers: Vec<Arc<dyn CompletionProvider>>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("providers", &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("policy", &self.policy)
            .finish()
    }
}

impl FallbackChain {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            providers: Vec::new(),
            policy,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.providers.push(provider);
        self
    }
}

#[async_trait]
impl Decomposer for FallbackChain {
    fn name(&self) -> &str {
        "fallback_chain"
    }

    async fn decompose(&self, request: &DecompositionRequest) -> Result<Vec<ActionInvocation>, DecompositionError> {
        let mut last_error = String::from("no providers configured");

        for provider in &self.providers {
            for attempt in 0..=self.policy.max_retries {
                let attempt_request = DecompositionRequest {
                    temperature: self.policy.temperature(attempt),
                    ..request.clone()
                };

                let outcome = match provider.complete(&attempt_request).await {
                    Ok(text) => parse_action_plan(&text).and_then(|actions| {
                        validate_action_plan(&actions, &request.scene)?;
                        Ok(actions)
                    }),
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(actions) => {
                        tracing::info!(
                            "Decomposed '{}' into {} actions via {}",
                            request.transcript.chars().take(50).collect::<String>(),
                            actions.len(),
                            provider.name()
                        );
                        return Ok(actions);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Decomposition attempt {} via {} failed: {e}",
                            attempt + 1,
                            provider.name()
                        );
                        let provider_down = matches!(e, DecompositionError::Provider { .. });
                        last_error = e.to_string();
                        if !e.is_retryable() {
                            break;
                        }
                        if provider_down && attempt < self.policy.max_retries {
                            tokio::time::sleep(self.policy.backoff(attempt)).await;
                        }
                    }
                }
            }
        }

        tracing::error!("All decomposition providers exhausted: {last_error}");
        Err(DecompositionError::Unavailable(last_error))
    }
}

/// Parses a provider answer into invocations.
///
/// Markdown code fences are stripped and an `{"actions": [...]}` wrapper is unwrapped.
/// Action names are upper-cased; a missing `params` is an empty map.
pub fn parse_action_plan(text: &str) -> Result<Vec<ActionInvocation>, DecompositionError> {
    let trimmed = text.trim();
    let body = if trimmed.starts_with("```") {
        trimmed
            .lines()
            .filter(|line| !line.trim().starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        trimmed.to_string()
    };

    let parsed: Value = serde_json::from_str(body.trim())
        .map_err(|e| DecompositionError::InvalidResponse(format!("not valid JSON: {e}")))?;
    let parsed = match parsed {
        Value::Object(mut map) if map.contains_key("actions") => map.remove("actions").unwrap_or(Value::Null),
        other => other,
    };
    let Value::Array(items) = parsed else {
        return Err(DecompositionError::InvalidResponse("output is not a JSON array".to_string()));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let Value::Object(mut map) = item else {
                return Err(DecompositionError::Rejected {
                    index,
                    reason: "is not an object".to_string(),
                });
            };
            let action = match map.remove("action") {
                Some(Value::String(s)) => s.trim().to_uppercase(),
                _ => {
                    return Err(DecompositionError::Rejected {
                        index,
                        reason: "missing 'action' name".to_string(),
                    })
                }
            };
            let params = match map.remove("params") {
                None | Some(Value::Null) => Params::new(),
                Some(Value::Object(p)) => p,
                Some(_) => {
                    return Err(DecompositionError::Rejected {
                        index,
                        reason: "'params' must be an object".to_string(),
                    })
                }
            };
            Ok(ActionInvocation { action, params })
        })
        .collect()
}

/// Checks a parsed plan against the scene: known primitives, and every `target`,
/// `target_container` and `objects` entry present.
pub fn validate_action_plan(actions: &[ActionInvocation], scene: &SceneState) -> Result<(), DecompositionError> {
    if actions.is_empty() {
        return Err(DecompositionError::InvalidResponse("empty action list".to_string()));
    }
    let available = || scene.objects.keys().cloned().collect::<BTreeSet<_>>();

    for (index, inv) in actions.iter().enumerate() {
        let id: ActionId = inv.action.parse().map_err(|_| DecompositionError::Rejected {
            index,
            reason: format!(
                "unknown primitive '{}'. Allowed: {:?}",
                inv.action,
                ActionId::ALL.map(ActionId::as_str)
            ),
        })?;

        for key in ["target", "target_container"] {
            if let Some(target) = inv.params.get(key).and_then(Value::as_str) {
                if scene.object(target).is_none() {
                    return Err(DecompositionError::Rejected {
                        index,
                        reason: format!("{id}: {key} '{target}' not in scene. Available: {:?}", available()),
                    });
                }
            }
        }

        if let Some(list) = inv.params.get("objects").and_then(Value::as_array) {
            if let Some(missing) = list.iter().filter_map(Value::as_str).find(|o| scene.object(o).is_none()) {
                return Err(DecompositionError::Rejected {
                    index,
                    reason: format!("{id}: object '{missing}' not in scene. Available: {:?}", available()),
                });
            }
        }
    }
    Ok(())
}
