//! JID parsing and validation (RFC 6120/6122, as constrained by §3).
//!
//! No regex is used — this mirrors the fast-path ping scan's "no regex on
//! untrusted input" posture and keeps the validator dependency-free.

use crate::error::XmppError;

const MAX_PART_LEN: usize = 1023;

/// A parsed JID: `localpart@domain[/resource]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    pub localpart: String,
    pub domain: String,
    pub resource: Option<String>,
}

impl Jid {
    /// Parse and validate a JID string per §3's invariant.
    pub fn parse(s: &str) -> Result<Jid, XmppError> {
        if s.is_empty() {
            return Err(XmppError::InvalidJid("empty".into()));
        }
        if has_control_chars(s) {
            return Err(XmppError::InvalidJid("control characters present".into()));
        }

        let (before_resource, resource) = match s.find('/') {
            Some(idx) => (&s[..idx], Some(s[idx + 1..].to_string())),
            None => (s, None),
        };
        if let Some(r) = &resource {
            if r.is_empty() || r.len() > MAX_PART_LEN {
                return Err(XmppError::InvalidJid("resource length out of bounds".into()));
            }
        }

        let at_count = before_resource.matches('@').count();
        if at_count != 1 {
            return Err(XmppError::InvalidJid(
                "must contain exactly one '@'".into(),
            ));
        }
        let at_idx = before_resource.find('@').unwrap();
        let localpart = &before_resource[..at_idx];
        let domain = &before_resource[at_idx + 1..];

        if localpart.is_empty() || localpart.len() > MAX_PART_LEN {
            return Err(XmppError::InvalidJid("localpart length out of bounds".into()));
        }
        if !localpart
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
        {
            return Err(XmppError::InvalidJid(
                "localpart must start with an alphanumeric character".into(),
            ));
        }

        validate_domain(domain)?;

        Ok(Jid {
            localpart: localpart.to_string(),
            domain: domain.to_string(),
            resource,
        })
    }

    /// `localpart@domain`, discarding any resource.
    pub fn to_bare(&self) -> String {
        format!("{}@{}", self.localpart, self.domain)
    }

    /// Full JID string, `localpart@domain[/resource]`.
    pub fn to_full(&self) -> String {
        match &self.resource {
            Some(r) => format!("{}@{}/{}", self.localpart, self.domain, r),
            None => self.to_bare(),
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }
}

fn has_control_chars(s: &str) -> bool {
    s.chars().any(|c| c.is_control())
}

fn validate_domain(domain: &str) -> Result<(), XmppError> {
    if domain.is_empty() || domain.len() > MAX_PART_LEN {
        return Err(XmppError::InvalidJid("domain length out of bounds".into()));
    }
    if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return Err(XmppError::InvalidJid("malformed domain labels".into()));
    }
    for label in domain.split('.') {
        if label.is_empty() {
            return Err(XmppError::InvalidJid("empty domain label".into()));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(XmppError::InvalidJid(
                "domain labels must be alphanumeric or '-'".into(),
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(XmppError::InvalidJid(
                "domain labels must not start or end with '-'".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_jid() {
        let jid = Jid::parse("alice@example.org").unwrap();
        assert_eq!(jid.localpart, "alice");
        assert_eq!(jid.domain, "example.org");
        assert!(jid.resource.is_none());
        assert!(jid.is_bare());
    }

    #[test]
    fn parses_full_jid() {
        let jid = Jid::parse("alice@example.org/phone").unwrap();
        assert_eq!(jid.resource.as_deref(), Some("phone"));
        assert!(!jid.is_bare());
        assert_eq!(jid.to_bare(), "alice@example.org");
        assert_eq!(jid.to_full(), "alice@example.org/phone");
    }

    #[test]
    fn rejects_missing_at() {
        assert!(Jid::parse("alice.example.org").is_err());
    }

    #[test]
    fn rejects_multiple_at() {
        assert!(Jid::parse("ali@ce@example.org").is_err());
    }

    #[test]
    fn rejects_empty_localpart() {
        assert!(Jid::parse("@example.org").is_err());
    }

    #[test]
    fn rejects_empty_domain() {
        assert!(Jid::parse("alice@").is_err());
    }

    #[test]
    fn rejects_control_chars() {
        assert!(Jid::parse("alice\n@example.org").is_err());
    }

    #[test]
    fn rejects_malformed_domain_labels() {
        assert!(Jid::parse("alice@.example.org").is_err());
        assert!(Jid::parse("alice@example..org").is_err());
        assert!(Jid::parse("alice@-example.org").is_err());
        assert!(Jid::parse("alice@example.org-").is_err());
        assert!(Jid::parse("alice@ex-ample.org").is_ok());
    }

    #[test]
    fn rejects_localpart_starting_non_alphanumeric() {
        assert!(Jid::parse("_alice@example.org").is_err());
    }

    #[test]
    fn rejects_oversized_parts() {
        let long = "a".repeat(1024);
        assert!(Jid::parse(&format!("{long}@example.org")).is_err());
        assert!(Jid::parse(&format!("alice@{long}")).is_err());
        assert!(Jid::parse(&format!("alice@example.org/{long}")).is_err());
    }

    #[test]
    fn rejects_empty_resource() {
        assert!(Jid::parse("alice@example.org/").is_err());
    }
}
