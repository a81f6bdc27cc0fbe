//! Outbound stanza templates for the C2S protocol.
//!
//! Generalizes the teacher's `xmpp/stanzas.rs`, which covered both the
//! component (XEP-0114) and client protocols with unescaped string
//! templates. This module keeps that template style — it is how the
//! whole example corpus builds XML, not via a DOM writer — but targets
//! only C2S, escapes interpolated values, and extends coverage to
//! binding, session, MUC, disco, and keepalive ping.
//!
//! Inbound parsing is not done here: stanzas arrive from
//! [`crate::xml::parser`] as a real tree, so extraction lives on
//! [`crate::xml::parser::Stanza`] and in `protocol::client`.

/// Escapes the five XML predefined entities for use in element text or
/// attribute values.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn stream_open(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{}' xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
        escape_xml(domain)
    )
}

pub fn starttls() -> &'static str {
    "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"
}

pub fn sasl_auth(mechanism: &str, initial_response_b64: &str) -> String {
    format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='{mechanism}'>{initial_response_b64}</auth>"
    )
}

pub fn sasl_response(payload_b64: &str) -> String {
    format!("<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{payload_b64}</response>")
}

pub fn bind_request(id: &str, resource: &str) -> String {
    format!(
        "<iq type='set' id='{id}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
         <resource>{}</resource></bind></iq>",
        escape_xml(resource)
    )
}

pub fn session_request(id: &str) -> String {
    format!("<iq type='set' id='{id}'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>")
}

pub fn initial_presence() -> &'static str {
    "<presence/>"
}

pub fn ping_request(id: &str) -> String {
    format!("<iq type='get' id='{id}'><ping xmlns='urn:xmpp:ping'/></iq>")
}

pub fn ping_reply(id: &str, to: &str) -> String {
    format!(
        "<iq type='result' id='{}' to='{}'/>",
        escape_xml(id),
        escape_xml(to)
    )
}

pub fn disco_items_request(id: &str, to: &str) -> String {
    format!(
        "<iq type='get' id='{id}' to='{}'><query xmlns='http://jabber.org/protocol/disco#items'/></iq>",
        escape_xml(to)
    )
}

/// MUC join: `room@service/nick` with a bounded history request.
pub fn muc_join(room_jid: &str, nick: &str, max_history: u32) -> String {
    format!(
        "<presence to='{}/{}'><x xmlns='http://jabber.org/protocol/muc'>\
         <history maxstanzas='{max_history}'/></x></presence>",
        escape_xml(room_jid),
        escape_xml(nick)
    )
}

pub fn muc_leave(room_jid: &str, nick: &str) -> String {
    format!(
        "<presence to='{}/{}' type='unavailable'/>",
        escape_xml(room_jid),
        escape_xml(nick)
    )
}

pub fn groupchat_message(to: &str, body: &str) -> String {
    format!(
        "<message to='{}' type='groupchat'><body>{}</body></message>",
        escape_xml(to),
        escape_xml(body)
    )
}

pub fn chat_message(to: &str, body: &str) -> String {
    format!(
        "<message to='{}' type='chat'><body>{}</body></message>",
        escape_xml(to),
        escape_xml(body)
    )
}
