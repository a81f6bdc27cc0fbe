//! Fast-path XEP-0199 ping response (§4.3).
//!
//! Runs in the I/O worker on freshly read bytes, before the Parser has
//! assembled a full [`crate::xml::parser::Stanza`] tree, so a pong can
//! go out even if the event consumer is backed up. Grounded in the
//! teacher's `xmpp/client.rs::extract_presence` — a bounded, allocation-light
//! string scan rather than a full parse — but narrower: it only ever
//! recognizes a server-originated ping IQ and only ever extracts `id`
//! and `from`. No regex is used, per the protocol's hard requirement for
//! untrusted-input fast paths.

use crate::protocol::stanzas;

const MAX_INPUT_LEN: usize = 4096;
const MAX_ATTR_LEN: usize = 512;

/// If `buf` contains a complete, well-formed server ping IQ, returns the
/// `<iq type='result' .../>` reply ready to write back. Returns `None`
/// on anything that doesn't unambiguously look like one (including
/// inputs over the length cap) so the normal parse path always gets a
/// chance to handle it.
pub fn try_build_pong(buf: &[u8]) -> Option<String> {
    if buf.len() > MAX_INPUT_LEN {
        return None;
    }
    let s = std::str::from_utf8(buf).ok()?;

    let iq_start = s.find("<iq")?;
    let after = &s[iq_start..];
    let tag_end = after.find('>')?;
    let opening_tag = &after[..=tag_end];

    if !is_get_type(opening_tag) {
        return None;
    }
    let body_and_rest = &after[tag_end + 1..];
    if opening_tag.ends_with("/>") {
        return None; // self-closing <iq .../> can't carry a <ping/> child
    }
    let close = body_and_rest.find("</iq>")?;
    let body = &body_and_rest[..close];
    if !body.contains("<ping") || !body.contains("urn:xmpp:ping") {
        return None;
    }

    let id = extract_attr(opening_tag, "id")?;
    let from = extract_attr(opening_tag, "from")?;
    Some(stanzas::ping_reply(&id, &from))
}

fn is_get_type(opening_tag: &str) -> bool {
    extract_attr(opening_tag, "type")
        .map(|t| t == "get")
        .unwrap_or(false)
}

/// Scans `tag` (a single opening-tag fragment, e.g. `<iq type='get' id='1'>`)
/// for `name='value'` or `name="value"`, rejecting values over
/// `MAX_ATTR_LEN` or containing `<`/`>`.
fn extract_attr(tag: &str, name: &str) -> Option<String> {
    let needle_single = format!("{name}='");
    let needle_double = format!("{name}=\"");

    let (start, quote) = if let Some(pos) = tag.find(&needle_single) {
        (pos + needle_single.len(), '\'')
    } else if let Some(pos) = tag.find(&needle_double) {
        (pos + needle_double.len(), '"')
    } else {
        return None;
    };

    let rest = &tag[start..];
    let end = rest.find(quote)?;
    if end > MAX_ATTR_LEN {
        return None;
    }
    let value = &rest[..end];
    if value.contains('<') || value.contains('>') {
        return None;
    }
    Some(value.to_string())
}
