use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::types::{
    ConversationId, DialectFamily, Priority, RequestId, RouteTarget, Scenario, SessionId,
};

/// One entry in the per-request stage log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLog {
    pub stage: String,
    /// Milliseconds since the request started.
    pub at_ms: u64,
}

/// Per-request record threaded through the dispatch pipeline.
///
/// The stream manager and header builder read dialect-family behavior from
/// this committed context, never from registry state captured elsewhere.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub session_id: Option<SessionId>,
    pub conversation_id: Option<ConversationId>,
    pub priority: Priority,
    /// The committed routing target for this attempt.
    pub target: RouteTarget,
    pub family: DialectFamily,
    pub scenario: Scenario,
    /// True when the client asked for the `custom-model` alias; enables failover.
    pub is_custom_model: bool,
    pub should_race: bool,
    pub race_candidates: Vec<RouteTarget>,
    pub alternatives: Vec<RouteTarget>,
    pub start_time: Instant,
    pub stage_log: Vec<StageLog>,
}

impl RequestContext {
    pub fn new(request_id: RequestId, target: RouteTarget, family: DialectFamily) -> Self {
        Self {
            request_id,
            session_id: None,
            conversation_id: None,
            priority: Priority::NORMAL,
            target,
            family,
            scenario: Scenario::Default,
            is_custom_model: false,
            should_race: false,
            race_candidates: Vec::new(),
            alternatives: Vec::new(),
            start_time: Instant::now(),
            stage_log: Vec::new(),
        }
    }

    /// Record a pipeline stage with its offset from request start.
    pub fn log_stage(&mut self, stage: impl Into<String>) {
        self.stage_log.push(StageLog {
            stage: stage.into(),
            at_ms: self.start_time.elapsed().as_millis() as u64,
        });
    }

    /// Clone this context for a race candidate, committing the candidate's
    /// target. Iflow-family candidates get a freshly randomized session
    /// suffix so concurrent racers do not share a provider-side session;
    /// other families share session IDs unchanged.
    pub fn for_candidate(
        &self,
        target: RouteTarget,
        family: DialectFamily,
        session_suffix: Option<&str>,
    ) -> Self {
        let mut ctx = self.clone();
        ctx.target = target;
        ctx.family = family;
        if family.requires_exclusive_session()
            && let Some(suffix) = session_suffix
        {
            if let Some(sid) = &ctx.session_id {
                ctx.session_id = Some(format!("{sid}-{suffix}"));
            }
            if let Some(cid) = &ctx.conversation_id {
                ctx.conversation_id = Some(format!("{cid}-{suffix}"));
            }
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        let mut c = RequestContext::new(
            "req-1".into(),
            RouteTarget::new("openrouter", "gpt-4o"),
            DialectFamily::OpenAi,
        );
        c.session_id = Some("sess".into());
        c.conversation_id = Some("conv".into());
        c
    }

    #[test]
    fn test_iflow_candidate_gets_fresh_session() {
        let base = ctx();
        let c = base.for_candidate(
            RouteTarget::new("iflow", "some-model"),
            DialectFamily::Iflow,
            Some("a1b2"),
        );
        assert_eq!(c.session_id.as_deref(), Some("sess-a1b2"));
        assert_eq!(c.conversation_id.as_deref(), Some("conv-a1b2"));
    }

    #[test]
    fn test_other_families_share_session() {
        let base = ctx();
        let c = base.for_candidate(
            RouteTarget::new("anthropic", "claude"),
            DialectFamily::Anthropic,
            Some("a1b2"),
        );
        assert_eq!(c.session_id.as_deref(), Some("sess"));
        assert_eq!(c.conversation_id.as_deref(), Some("conv"));
    }

    #[test]
    fn test_stage_log_appends() {
        let mut c = ctx();
        c.log_stage("routed");
        c.log_stage("reserved");
        assert_eq!(c.stage_log.len(), 2);
        assert_eq!(c.stage_log[0].stage, "routed");
    }
}
