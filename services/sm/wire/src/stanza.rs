//! Countable stanza classification.
//!
//! Only the three RFC 6120 stanza kinds advance the stream management
//! counters. Everything else on the stream (nonzas, stream features, SASL,
//! the component handshake) is invisible to the overlay.

use minidom::Element;

/// Stanza kinds counted by the reliability overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    /// `<presence/>`
    Presence,
    /// `<message/>`
    Message,
    /// `<iq/>`
    Iq,
}

impl StanzaKind {
    /// Classify an element by name
    pub fn of(element: &Element) -> Option<Self> {
        match element.name() {
            "presence" => Some(StanzaKind::Presence),
            "message" => Some(StanzaKind::Message),
            "iq" => Some(StanzaKind::Iq),
            _ => None,
        }
    }

    /// Element name for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaKind::Presence => "presence",
            StanzaKind::Message => "message",
            StanzaKind::Iq => "iq",
        }
    }
}

/// Whether the element is a countable stanza
pub fn is_countable(element: &Element) -> bool {
    StanzaKind::of(element).is_some()
}
