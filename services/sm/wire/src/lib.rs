//! Stream management nonzas, stanza classification and XML element helpers.
//!
//! This crate provides the wire-level vocabulary of XEP-0198 stream
//! management on top of [`minidom::Element`]: typed nonzas for the
//! `urn:xmpp:sm:3` namespace, strict attribute parsing, and the rule that
//! decides which elements are counted by the reliability overlay.
//!
//! ## Elements
//!
//! ```text
//! client                                   server
//!   | <enable resume='true'/>                 |
//!   | --------------------------------------> |
//!   |           <enabled id='..' max='600'/>  |
//!   | <-------------------------------------- |
//!   | <r/>                                    |
//!   | --------------------------------------> |
//!   |                          <a h='0'/>     |
//!   | <-------------------------------------- |
//!   | <resume h='5' previd='..'/>             |
//!   | --------------------------------------> |
//!   |           <resumed h='3' previd='..'/>  |
//!   | <-------------------------------------- |
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod nonza;
pub mod stanza;

/// XEP-0198 stream management namespace
pub const NS_SM: &str = "urn:xmpp:sm:3";

/// RFC 6120 stanza error conditions namespace
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

// Re-export main types
pub use error::WireError;
pub use nonza::{ack, enable, request, resume, Nonza};
pub use stanza::{is_countable, StanzaKind};

pub use minidom::Element;
