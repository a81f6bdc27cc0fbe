//! XMPP client core and session supervisor for a desktop chat application.
//!
//! Layering (§2): Transport → XML Stream Parser → Protocol Client →
//! Session Supervisor → Chat Log Store, plus Persistence Interfaces used
//! by the Supervisor.

pub mod backoff;
pub mod config;
pub mod error;
pub mod jid;
pub mod logstore;
pub mod model;
pub mod persistence;
pub mod protocol;
pub mod supervisor;
pub mod transport;
pub mod xml;
