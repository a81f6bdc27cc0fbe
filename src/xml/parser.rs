//! Streaming XML parser for a single never-closing `<stream:stream>` document.
//!
//! Generalizes the stanza-boundary detection shown in the sibling
//! fluux-messenger proxy's `xmpp_proxy::framing::extract_stanza` (a
//! single-call, depth-tracked quick-xml walk over whatever bytes are
//! currently buffered) into a persistent parser that also builds a real
//! `Stanza` tree and implements §4.2's mid-stream recovery, generation
//! counter, and XML-declaration stripping.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader;

/// Parsed XML element at stream child depth 1 (§3).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stanza {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Stanza>,
    pub text: String,
    pub xmlns: Option<String>,
}

impl Stanza {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Stanza> {
        self.children.iter().find(|c| c.local_name() == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Stanza> {
        self.children.iter().filter(move |c| c.local_name() == name)
    }

    /// `name` with any `prefix:` stripped.
    pub fn local_name(&self) -> &str {
        match self.name.find(':') {
            Some(idx) => &self.name[idx + 1..],
            None => &self.name,
        }
    }
}

/// Events the parser emits to the Protocol Client.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// `<stream:stream ...>` opened. Emitted once per active stream —
    /// never re-emitted across an in-place recovery.
    StreamOpened(HashMap<String, String>),
    /// `<stream:features>` closed at depth 2.
    Features(Stanza),
    /// Any other depth-2 element closed.
    Stanza(Stanza),
    /// `</stream:stream>` closed, or recovery exhausted.
    StreamClosed { generation: u64 },
    /// A parse error before `stream_opened` was ever emitted.
    FatalParseError(String),
}

/// Maximum consecutive in-place recoveries before giving up (§4.2).
const MAX_CONSECUTIVE_RECOVERIES: u32 = 3;

/// Push-parser over a single XMPP stream.
pub struct StreamParser {
    buffer: Vec<u8>,
    stream_open: bool,
    recovery_count: u32,
    generation: u64,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        StreamParser {
            buffer: Vec::new(),
            stream_open: false,
            recovery_count: 0,
            generation: 0,
        }
    }

    /// Generation stamp of the current (possibly recovered) parser
    /// internals. Async close notifications from a stale generation
    /// must be discarded by the caller.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_stream_open(&self) -> bool {
        self.stream_open
    }

    /// Feed newly-received bytes and drain as many complete events as
    /// the buffer currently allows.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            self.strip_leading_mid_stream_decl();

            if self.buffer.is_empty() {
                break;
            }

            match extract_one(&self.buffer, self.stream_open) {
                ExtractOutcome::Complete(unit) => {
                    self.buffer.drain(..unit.consumed);
                    match unit.kind {
                        UnitKind::StreamOpen(attrs) => {
                            self.stream_open = true;
                            events.push(StreamEvent::StreamOpened(attrs));
                        }
                        UnitKind::StreamClose => {
                            self.stream_open = false;
                            events.push(StreamEvent::StreamClosed {
                                generation: self.generation,
                            });
                            break;
                        }
                        UnitKind::Features(s) => {
                            self.recovery_count = 0;
                            events.push(StreamEvent::Features(s));
                        }
                        UnitKind::Stanza(s) => {
                            self.recovery_count = 0;
                            events.push(StreamEvent::Stanza(s));
                        }
                    }
                }
                ExtractOutcome::Incomplete => break,
                ExtractOutcome::SyntaxError { consumed } => {
                    if !self.stream_open {
                        events.push(StreamEvent::FatalParseError(
                            "malformed XML before stream was opened".into(),
                        ));
                        break;
                    }
                    // Discard the malformed fragment and resynchronize; never
                    // get stuck if the error reports zero progress.
                    let drop_len = consumed.max(1).min(self.buffer.len());
                    self.buffer.drain(..drop_len);
                    self.recovery_count += 1;
                    self.generation += 1;

                    if self.recovery_count > MAX_CONSECUTIVE_RECOVERIES {
                        self.stream_open = false;
                        events.push(StreamEvent::StreamClosed {
                            generation: self.generation,
                        });
                        break;
                    }
                }
            }
        }

        events
    }

    /// XMPP servers legally emit a fresh `<?xml ... ?>` declaration after
    /// STARTTLS, which strict XML forbids mid-document. Strip one if the
    /// buffer currently starts with it and we're already inside a stream —
    /// it carries no information the consumer needs.
    fn strip_leading_mid_stream_decl(&mut self) {
        if !self.stream_open {
            return;
        }
        let trimmed_start = self
            .buffer
            .iter()
            .position(|&b| !b.is_ascii_whitespace())
            .unwrap_or(self.buffer.len());
        if self.buffer[trimmed_start..].starts_with(b"<?xml") {
            if let Some(rel_end) = find_subslice(&self.buffer[trimmed_start..], b"?>") {
                let end = trimmed_start + rel_end + 2;
                self.buffer.drain(..end);
            }
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

enum UnitKind {
    StreamOpen(HashMap<String, String>),
    StreamClose,
    Features(Stanza),
    Stanza(Stanza),
}

struct Unit {
    consumed: usize,
    kind: UnitKind,
}

enum ExtractOutcome {
    Complete(Unit),
    Incomplete,
    SyntaxError { consumed: usize },
}

fn is_stream_tag(name: &[u8]) -> bool {
    name == b"stream:stream" || name.ends_with(b":stream")
}

fn attrs_to_map(e: &quick_xml::events::BytesStart) -> HashMap<String, String> {
    e.attributes()
        .flatten()
        .map(|a| {
            (
                String::from_utf8_lossy(a.key.as_ref()).into_owned(),
                String::from_utf8_lossy(&a.value).into_owned(),
            )
        })
        .collect()
}

fn attrs_to_vec(e: &quick_xml::events::BytesStart) -> Vec<(String, String)> {
    e.attributes()
        .flatten()
        .map(|a| {
            (
                String::from_utf8_lossy(a.key.as_ref()).into_owned(),
                String::from_utf8_lossy(&a.value).into_owned(),
            )
        })
        .collect()
}

/// Walk one complete top-level unit out of `buffer`, starting at offset 0.
/// `stream_open` tells us whether a bare-looking root element should be
/// treated as the stream header (only meaningful once, before it's seen)
/// or as an ordinary stanza.
fn extract_one(buffer: &[u8], stream_open: bool) -> ExtractOutcome {
    // `</stream:stream>` can appear with nothing open around it.
    let first_nonspace = buffer
        .iter()
        .position(|&b| !b.is_ascii_whitespace())
        .unwrap_or(buffer.len());
    if buffer[first_nonspace..].starts_with(b"</stream:stream>") {
        let end = first_nonspace + "</stream:stream>".len();
        return ExtractOutcome::Complete(Unit {
            consumed: end,
            kind: UnitKind::StreamClose,
        });
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut stack: Vec<Stanza> = Vec::new();
    let mut local_depth: u32 = 0;

    loop {
        let pos_before = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Decl(_))
            | Ok(Event::PI(_))
            | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => continue,
            Ok(Event::Start(e)) => {
                let raw_name = e.name().as_ref().to_vec();
                if local_depth == 0 && !stream_open && is_stream_tag(&raw_name) {
                    let consumed = reader.buffer_position() as usize;
                    return ExtractOutcome::Complete(Unit {
                        consumed,
                        kind: UnitKind::StreamOpen(attrs_to_map(&e)),
                    });
                }
                local_depth += 1;
                let name = String::from_utf8_lossy(&raw_name).into_owned();
                let attrs = attrs_to_vec(&e);
                let xmlns = attrs
                    .iter()
                    .find(|(k, _)| k == "xmlns")
                    .map(|(_, v)| v.clone());
                stack.push(Stanza {
                    name,
                    attrs,
                    children: Vec::new(),
                    text: String::new(),
                    xmlns,
                });
            }
            Ok(Event::Empty(e)) => {
                let raw_name = e.name().as_ref().to_vec();
                if local_depth == 0 && !stream_open && is_stream_tag(&raw_name) {
                    let consumed = reader.buffer_position() as usize;
                    return ExtractOutcome::Complete(Unit {
                        consumed,
                        kind: UnitKind::StreamOpen(attrs_to_map(&e)),
                    });
                }
                let name = String::from_utf8_lossy(&raw_name).into_owned();
                let attrs = attrs_to_vec(&e);
                let xmlns = attrs
                    .iter()
                    .find(|(k, _)| k == "xmlns")
                    .map(|(_, v)| v.clone());
                let leaf = Stanza {
                    name,
                    attrs,
                    children: Vec::new(),
                    text: String::new(),
                    xmlns,
                };
                if local_depth == 0 {
                    let consumed = reader.buffer_position() as usize;
                    return finish_top_level(leaf, consumed);
                }
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(leaf);
                }
            }
            Ok(Event::Text(t)) | Ok(Event::CData(t)) => {
                if let Some(top) = stack.last_mut() {
                    let text = t.decode().unwrap_or_default();
                    top.text.push_str(&text);
                }
            }
            Ok(Event::End(_)) => {
                if local_depth == 0 {
                    // Stray close at top level (malformed); let caller resync.
                    return ExtractOutcome::SyntaxError { consumed: pos_before };
                }
                local_depth -= 1;
                let finished = stack.pop().expect("stack non-empty at matching depth");
                if local_depth == 0 {
                    let consumed = reader.buffer_position() as usize;
                    return finish_top_level(finished, consumed);
                }
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(finished);
                }
            }
            Ok(Event::Eof) => return ExtractOutcome::Incomplete,
            Err(_) => return ExtractOutcome::SyntaxError { consumed: pos_before },
        }
    }
}

fn finish_top_level(stanza: Stanza, consumed: usize) -> ExtractOutcome {
    let kind = if stanza.local_name() == "features" {
        UnitKind::Features(stanza)
    } else {
        UnitKind::Stanza(stanza)
    };
    ExtractOutcome::Complete(Unit { consumed, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_open() -> &'static [u8] {
        b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.org' version='1.0'>"
    }

    #[test]
    fn emits_stream_opened_once() {
        let mut p = StreamParser::new();
        let events = p.feed(stream_open());
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::StreamOpened(attrs) => {
                assert_eq!(attrs.get("to").map(String::as_str), Some("example.org"));
            }
            other => panic!("expected StreamOpened, got {other:?}"),
        }
        assert!(p.is_stream_open());
    }

    #[test]
    fn emits_features_distinct_from_stanza() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let events = p.feed(b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Features(_)));
    }

    #[test]
    fn emits_generic_stanza() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let events = p.feed(b"<presence/>");
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Stanza(s) => assert_eq!(s.local_name(), "presence"),
            other => panic!("expected Stanza, got {other:?}"),
        }
    }

    #[test]
    fn builds_nested_stanza_tree_with_text() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let events = p.feed(
            b"<message from='a@b' to='c@d' type='chat'><body>Hello &amp; welcome</body></message>",
        );
        let StreamEvent::Stanza(s) = &events[0] else {
            panic!("expected stanza")
        };
        assert_eq!(s.local_name(), "message");
        assert_eq!(s.attr("from"), Some("a@b"));
        let body = s.child("body").unwrap();
        assert_eq!(body.text, "Hello & welcome");
    }

    #[test]
    fn handles_fragmented_feed_across_calls() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let mut events = p.feed(b"<iq type='get'><query xmlns='jabber:iq:roster'>");
        assert!(events.is_empty());
        events = p.feed(b"</query></iq>");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Stanza(_)));
    }

    #[test]
    fn multiple_stanzas_in_one_feed_preserve_order() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let events = p.feed(b"<presence/><message to='a@b'><body>hi</body></message>");
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Stanza(ref s) if s.local_name() == "presence"));
        assert!(matches!(events[1], StreamEvent::Stanza(ref s) if s.local_name() == "message"));
    }

    #[test]
    fn strips_mid_stream_xml_declaration() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let events = p.feed(b"<?xml version='1.0'?><presence/>");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Stanza(_)));
    }

    #[test]
    fn stream_close_emits_event_and_closes() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let events = p.feed(b"</stream:stream>");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::StreamClosed { .. }));
        assert!(!p.is_stream_open());
    }

    #[test]
    fn fatal_parse_error_before_stream_opened() {
        let mut p = StreamParser::new();
        // A stray closing tag with no matching open is unambiguously
        // malformed, not just truncated input awaiting more bytes.
        let events = p.feed(b"</foo>");
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::FatalParseError(_))));
        assert!(!p.is_stream_open());
    }

    #[test]
    fn mid_stream_recovery_resyncs_and_resets_counter() {
        // Scenario D: a complete message, then a malformed fragment (a
        // stray closing tag with no matching open), then a presence that
        // must still be emitted after in-place recovery.
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let events = p.feed(b"<message><body>hi</body></message></mes><presence/>");
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Stanza(s) if s.local_name() == "message")));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::Stanza(s) if s.local_name() == "presence")));
        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::StreamClosed { .. })));
        assert!(p.is_stream_open());
    }

    #[test]
    fn recovery_gives_up_after_three_consecutive_failures() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        // Four consecutive malformed fragments with no successful stanza
        // between them must exhaust recovery and close the stream.
        let events = p.feed(b"</a></b></c></d>");
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::StreamClosed { .. })));
        assert!(!p.is_stream_open());
    }

    #[test]
    fn recovery_counter_resets_on_successful_stanza() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        p.feed(b"</a><presence/>"); // one recovery, then a good stanza
        p.feed(b"</b><presence/>"); // another isolated recovery
        p.feed(b"</c><presence/>");
        // Each recovery was followed by a successful stanza, so the
        // consecutive count never reached the cap — stream stays open.
        assert!(p.is_stream_open());
    }

    #[test]
    fn generation_bumps_on_recovery() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let gen0 = p.generation();
        p.feed(b"</a><presence/>");
        assert!(p.generation() > gen0);
    }

    #[test]
    fn empty_feed_is_a_noop() {
        let mut p = StreamParser::new();
        assert!(p.feed(b"").is_empty());
    }

    #[test]
    fn self_closing_stream_management_stanzas() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let events = p.feed(b"<r xmlns='urn:xmpp:sm:3'/>");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Stanza(ref s) if s.local_name() == "r"));
    }

    #[test]
    fn cdata_is_captured_as_text() {
        let mut p = StreamParser::new();
        p.feed(stream_open());
        let events = p.feed(b"<message><body><![CDATA[raw <stuff>]]></body></message>");
        let StreamEvent::Stanza(s) = &events[0] else {
            panic!("expected stanza")
        };
        assert_eq!(s.child("body").unwrap().text, "raw <stuff>");
    }
}
