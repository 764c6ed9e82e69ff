use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};

use crate::prompt::{DecisionRequest, ReasoningCall, ReasoningPrompt, SynthesisRequest};
use crate::schema::{Decision, Synthesis, parse_decision, parse_synthesis};
use crate::{InferError, ReasoningService};

/// Wraps a reasoning service with per-call timeouts and one strict-format retry.
#[derive(Clone)]
pub struct ReasoningClient {
    service: Arc<dyn ReasoningService>,
    call_timeout: Duration,
}

impl ReasoningClient {
    pub fn new(service: Arc<dyn ReasoningService>, call_timeout: Duration) -> Self {
        Self {
            service,
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub async fn decide(
        &self,
        request: &DecisionRequest,
        deadline: Instant,
    ) -> Result<Decision, InferError> {
        self.call_with_retry(ReasoningCall::Decision(request.clone()), deadline, |reply| {
            parse_decision(reply)
        })
        .await
    }

    pub async fn synthesize(
        &self,
        request: &SynthesisRequest,
        deadline: Instant,
    ) -> Result<Synthesis, InferError> {
        self.call_with_retry(ReasoningCall::Synthesis(request.clone()), deadline, |reply| {
            parse_synthesis(reply)
        })
        .await
    }

    async fn call_with_retry<T>(
        &self,
        call: ReasoningCall,
        deadline: Instant,
        parse: impl Fn(&str) -> Result<T, InferError>,
    ) -> Result<T, InferError> {
        let kind = call.kind();
        let mut prompt = ReasoningPrompt { call, strict: false };

        let reply = self.complete_once(&prompt, deadline).await?;
        match parse(&reply) {
            Ok(parsed) => return Ok(parsed),
            Err(err) => {
                tracing::warn!(call = kind, error = %err, "malformed reasoning reply, retrying with strict prompt");
            }
        }

        prompt.strict = true;
        let reply = self.complete_once(&prompt, deadline).await?;
        parse(&reply).map_err(|err| match err {
            InferError::Malformed(message) => {
                InferError::Malformed(format!("{kind} reply malformed after retry: {message}"))
            }
            other => other,
        })
    }

    async fn complete_once(
        &self,
        prompt: &ReasoningPrompt,
        deadline: Instant,
    ) -> Result<String, InferError> {
        let call_deadline = deadline.min(Instant::now() + self.call_timeout);
        match timeout_at(call_deadline, self.service.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(InferError::Timeout {
                millis: self.call_timeout.as_millis() as u64,
            }),
        }
    }
}
