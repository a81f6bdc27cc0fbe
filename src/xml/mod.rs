pub mod parser;

pub use parser::{Stanza, StreamEvent, StreamParser};
