use relay_core::{DialectFamily, RequestContext};
use ring::hmac;

/// Builds the final header map for an upstream request.
///
/// Ordering matters: defaults, family overlay, session tracking, stream
/// accept, then custom headers, with case-insensitive last-write-wins
/// deduplication at the end.
pub struct HeaderBuilder<'a> {
    ctx: &'a RequestContext,
    api_key: &'a str,
    stream: bool,
    custom: Vec<(String, String)>,
    auth_override: Option<Vec<(String, String)>>,
}

impl<'a> HeaderBuilder<'a> {
    pub fn new(ctx: &'a RequestContext, api_key: &'a str) -> Self {
        Self {
            ctx,
            api_key,
            stream: false,
            custom: Vec::new(),
            auth_override: None,
        }
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Provider-configured headers, appended last.
    pub fn custom_headers<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.custom.extend(headers);
        self
    }

    /// Authorization produced by a transformer's auth hook (bypass path).
    /// Replaces the default `Authorization: Bearer` header.
    pub fn auth_from_transformer(mut self, headers: Vec<(String, String)>) -> Self {
        self.auth_override = Some(headers);
        self
    }

    pub fn build(self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = vec![
            ("Content-Type".into(), "application/json".into()),
            ("X-Request-ID".into(), self.ctx.request_id.clone()),
        ];

        match self.auth_override {
            Some(auth) => headers.extend(auth),
            None => headers.push(("Authorization".into(), format!("Bearer {}", self.api_key))),
        }

        // Family overlay. The iflow family insists on lowercase client
        // identity headers.
        if self.ctx.family == DialectFamily::Iflow {
            headers.push(("user-agent".into(), "relay/0.1".into()));
            headers.push(("x-client-type".into(), "relay".into()));
            headers.push(("x-client-version".into(), env!("CARGO_PKG_VERSION").into()));
        }

        // Session tracking, lowercase for iflow, capitalized elsewhere.
        let (session_key, conversation_key) = if self.ctx.family == DialectFamily::Iflow {
            ("session-id", "conversation-id")
        } else {
            ("X-Session-Id", "X-Conversation-Id")
        };
        if let Some(sid) = &self.ctx.session_id {
            headers.push((session_key.into(), sid.clone()));
        }
        if let Some(cid) = &self.ctx.conversation_id {
            headers.push((conversation_key.into(), cid.clone()));
        }

        // Stream accept, unless the family forbids it.
        if self.stream {
            let accept = if self.ctx.family.requires_json_accept() {
                "application/json"
            } else {
                "text/event-stream"
            };
            headers.push(("Accept".into(), accept.into()));
        }

        headers.extend(self.custom);
        dedup_case_insensitive(headers)
    }
}

/// Last write wins under case-insensitive key equality, preserving the
/// surviving entry's original casing and position of first occurrence.
fn dedup_case_insensitive(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::with_capacity(headers.len());
    for (key, value) in headers {
        if let Some(existing) = out
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            *existing = (key, value);
        } else {
            out.push((key, value));
        }
    }
    out
}

/// Per-family HMAC-SHA256 request signer.
///
/// The data string is the values of the named header fields joined by ':'
/// with the timestamp appended, signed with the API key as secret. Re-run on
/// every retry so the timestamp stays inside the verification window.
#[derive(Debug, Clone)]
pub struct Signer {
    /// Header names whose values feed the signature, in order.
    pub fields: Vec<String>,
    pub signature_header: String,
    pub timestamp_header: String,
}

impl Signer {
    /// The iflow family's signing recipe.
    pub fn iflow() -> Self {
        Self {
            fields: vec!["session-id".into(), "x-client-type".into()],
            signature_header: "X-Iflow-Signature".into(),
            timestamp_header: "X-Iflow-Timestamp".into(),
        }
    }

    /// Recipe for a dialect family, when one exists.
    pub fn for_family(family: DialectFamily) -> Option<Self> {
        match family {
            DialectFamily::Iflow => Some(Self::iflow()),
            _ => None,
        }
    }

    /// Sign the header set in place, using the given unix-millisecond
    /// timestamp. Missing fields contribute empty strings.
    pub fn sign(&self, headers: &mut Vec<(String, String)>, api_key: &str, timestamp_ms: i64) {
        let mut parts: Vec<String> = Vec::with_capacity(self.fields.len() + 1);
        for field in &self.fields {
            let value = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(field))
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            parts.push(value);
        }
        parts.push(timestamp_ms.to_string());
        let data = parts.join(":");

        let key = hmac::Key::new(hmac::HMAC_SHA256, api_key.as_bytes());
        let tag = hmac::sign(&key, data.as_bytes());
        let signature = hex::encode(tag.as_ref());

        headers.retain(|(k, _)| {
            !k.eq_ignore_ascii_case(&self.signature_header)
                && !k.eq_ignore_ascii_case(&self.timestamp_header)
        });
        headers.push((self.signature_header.clone(), signature));
        headers.push((self.timestamp_header.clone(), timestamp_ms.to_string()));
    }
}
