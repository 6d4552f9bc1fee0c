use relay_core::{RequestContext, Result};
use serde_json::Value;

use crate::chain::{Capabilities, TransformMessage, Transformer};

/// The iflow dialect family speaks the unified `chat.completions` shape on
/// the wire but has its own header discipline: lowercase client-identity
/// headers, lowercase session tracking, `application/json` accept even for
/// streams, and an HMAC request signature. All of that lives in the header
/// builder and signer; the body-level transformer only pins the session into
/// the payload, which the family requires for its server-side affinity.
pub struct IflowTransformer;

impl Transformer for IflowTransformer {
    fn name(&self) -> &'static str {
        "iflow"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            request_in: true,
            auth: true,
            ..Default::default()
        }
    }

    fn request_in(&self, msg: TransformMessage, ctx: &RequestContext) -> Result<TransformMessage> {
        let mut msg = msg;
        if let Value::Object(body) = &mut msg.body {
            if let Some(sid) = &ctx.session_id {
                body.insert("session_id".into(), Value::String(sid.clone()));
            }
            if let Some(cid) = &ctx.conversation_id {
                body.insert("conversation_id".into(), Value::String(cid.clone()));
            }
        }
        Ok(msg)
    }

    fn auth_headers(&self, _ctx: &RequestContext, api_key: &str) -> Vec<(String, String)> {
        vec![("authorization".into(), format!("Bearer {api_key}"))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{DialectFamily, RouteTarget};
    use serde_json::json;

    #[test]
    fn test_session_pinned_into_body() {
        let mut ctx = RequestContext::new(
            "req".into(),
            RouteTarget::new("iflow", "m"),
            DialectFamily::Iflow,
        );
        ctx.session_id = Some("s-1".into());
        ctx.conversation_id = Some("c-1".into());

        let t = IflowTransformer;
        let out = t
            .request_in(TransformMessage::new(json!({"model": "m"})), &ctx)
            .unwrap();
        assert_eq!(out.body["session_id"], "s-1");
        assert_eq!(out.body["conversation_id"], "c-1");
    }
}
