use relay_core::RequestContext;

use crate::chain::{Capabilities, Transformer};

/// The unified interchange shape is the OpenAI `chat.completions` format, so
/// this transformer is pure passthrough plus the Bearer auth hook. Providers
/// whose chain is exactly `["openai"]` qualify for the bypass optimization.
pub struct OpenAiTransformer;

impl Transformer for OpenAiTransformer {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            auth: true,
            ..Default::default()
        }
    }

    fn auth_headers(&self, _ctx: &RequestContext, api_key: &str) -> Vec<(String, String)> {
        vec![("Authorization".into(), format!("Bearer {api_key}"))]
    }
}
