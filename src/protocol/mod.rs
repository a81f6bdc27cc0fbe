//! Protocol Client: the XMPP state machine running on top of
//! [`crate::transport::Transport`] and [`crate::xml::parser::StreamParser`]
//! (§4.3).

pub mod client;
pub mod fastpath;
pub mod sasl;
pub mod stanzas;

pub use client::{
    ClientCommand, ClientEvent, IncomingMessage, IncomingMessageKind, IncomingPresence, MucItem,
    ProtocolClient,
};
