use bytes::Bytes;

/// One parsed server-sent event.
///
/// The upstream wire format is one event per `data:` payload separated by a
/// blank line; `[DONE]` marks clean EOF; lines beginning with `:` are
/// comments (heartbeats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload, with its optional `event:` name.
    Data {
        event: Option<String>,
        data: String,
    },
    /// A comment line (without the leading ':').
    Comment(String),
    /// The `[DONE]` sentinel.
    Done,
}

/// Incremental SSE parser. Feed raw bytes as they arrive; complete events
/// come out as they terminate on a blank line.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    pending_event: Option<String>,
    pending_data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line terminates the in-flight event.
                if !self.pending_data.is_empty() {
                    let data = self.pending_data.join("\n");
                    let event = self.pending_event.take();
                    self.pending_data.clear();
                    if data == "[DONE]" {
                        events.push(SseEvent::Done);
                    } else {
                        events.push(SseEvent::Data { event, data });
                    }
                }
                continue;
            }
            if let Some(comment) = line.strip_prefix(':') {
                events.push(SseEvent::Comment(comment.trim_start().to_string()));
                continue;
            }
            if let Some(name) = line.strip_prefix("event:") {
                self.pending_event = Some(name.trim().to_string());
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.pending_data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // Unknown field names are ignored, per the SSE spec.
        }
        events
    }

    /// Flush a trailing event that was never terminated by a blank line
    /// (upstream closed mid-event).
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.pending_data.is_empty() {
            return None;
        }
        let data = self.pending_data.join("\n");
        self.pending_data.clear();
        let event = self.pending_event.take();
        if data == "[DONE]" {
            Some(SseEvent::Done)
        } else {
            Some(SseEvent::Data { event, data })
        }
    }
}

/// Serialize one event to its wire form. `serialize ∘ parse` is identity on
/// well-formed events.
pub fn serialize_event(event: &SseEvent) -> Bytes {
    let out = match event {
        SseEvent::Data { event: Some(name), data } => {
            format!("event: {name}\ndata: {data}\n\n")
        }
        SseEvent::Data { event: None, data } => format!("data: {data}\n\n"),
        SseEvent::Comment(text) => format!(": {text}\n\n"),
        SseEvent::Done => "data: [DONE]\n\n".to_string(),
    };
    Bytes::from(out)
}

/// The heartbeat comment frame.
pub fn heartbeat_frame() -> Bytes {
    Bytes::from_static(b":ping\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_event() {
        let mut p = SseParser::new();
        let events = p.feed(b"data: {\"x\":1}\n\n");
        assert_eq!(
            events,
            vec![SseEvent::Data {
                event: None,
                data: "{\"x\":1}".into()
            }]
        );
    }

    #[test]
    fn test_parse_named_event() {
        let mut p = SseParser::new();
        let events = p.feed(b"event: error\ndata: {\"error\":\"boom\"}\n\n");
        assert_eq!(
            events,
            vec![SseEvent::Data {
                event: Some("error".into()),
                data: "{\"error\":\"boom\"}".into()
            }]
        );
    }

    #[test]
    fn test_parse_split_across_chunks() {
        let mut p = SseParser::new();
        assert!(p.feed(b"data: hel").is_empty());
        assert!(p.feed(b"lo\n").is_empty());
        let events = p.feed(b"\n");
        assert_eq!(
            events,
            vec![SseEvent::Data {
                event: None,
                data: "hello".into()
            }]
        );
    }

    #[test]
    fn test_parse_comment_and_done() {
        let mut p = SseParser::new();
        let events = p.feed(b":ping\n\ndata: [DONE]\n\n");
        assert_eq!(
            events,
            vec![SseEvent::Comment("ping".into()), SseEvent::Done]
        );
    }

    #[test]
    fn test_multiline_data() {
        let mut p = SseParser::new();
        let events = p.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(
            events,
            vec![SseEvent::Data {
                event: None,
                data: "line1\nline2".into()
            }]
        );
    }

    #[test]
    fn test_crlf_lines() {
        let mut p = SseParser::new();
        let events = p.feed(b"data: x\r\n\r\n");
        assert_eq!(
            events,
            vec![SseEvent::Data {
                event: None,
                data: "x".into()
            }]
        );
    }

    #[test]
    fn test_round_trip_identity() {
        let cases = vec![
            SseEvent::Data {
                event: None,
                data: "{\"a\":1}".into(),
            },
            SseEvent::Data {
                event: Some("delta".into()),
                data: "text".into(),
            },
            SseEvent::Comment("ping".into()),
            SseEvent::Done,
        ];
        for case in cases {
            let wire = serialize_event(&case);
            let mut p = SseParser::new();
            let parsed = p.feed(&wire);
            assert_eq!(parsed, vec![case]);
        }
    }

    #[test]
    fn test_heartbeat_dropped_by_comment_filter() {
        // A client-side decoder that keeps only data events sees an unchanged
        // stream when heartbeats are interleaved.
        let mut p = SseParser::new();
        let events = p.feed(b"data: a\n\n:ping\n\ndata: b\n\ndata: [DONE]\n\n");
        let data_only: Vec<&SseEvent> = events
            .iter()
            .filter(|e| !matches!(e, SseEvent::Comment(_)))
            .collect();
        assert_eq!(data_only.len(), 3);
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut p = SseParser::new();
        assert!(p.feed(b"data: partial\n").is_empty());
        assert_eq!(
            p.finish(),
            Some(SseEvent::Data {
                event: None,
                data: "partial".into()
            })
        );
        assert_eq!(p.finish(), None);
    }
}
