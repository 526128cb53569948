//! Typed stream management nonzas.
//!
//! Parsing is strict about the attributes the state machine depends on: a
//! counter that is missing or not an unsigned 32-bit integer is reported as a
//! [`WireError`] rather than being read as zero.

use crate::error::WireError;
use crate::{NS_SM, NS_STANZAS};
use minidom::Element;
use std::fmt;
use tracing::debug;

/// A stream management element in the `urn:xmpp:sm:3` namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nonza {
    /// `<enable/>`: turn on acknowledgment tracking
    Enable {
        /// Whether stream resumption is requested
        resume: bool,
    },
    /// `<enabled/>`: peer accepted the enable request
    Enabled {
        /// Resumable session id, present when resumption was granted
        id: Option<String>,
        /// Resumption window in seconds
        max: Option<u32>,
        /// Whether the peer granted resumption
        resume: bool,
    },
    /// `<resume/>`: reattach to a previous session
    Resume {
        /// Inbound stanzas handled on the previous stream
        h: u32,
        /// Previous session id
        previd: String,
    },
    /// `<resumed/>`: peer reattached the session
    Resumed {
        /// Outbound stanzas the peer handled on the previous stream
        h: Option<u32>,
        /// Session id that was resumed
        previd: Option<String>,
    },
    /// `<failed/>`: enable or resume rejected
    Failed {
        /// Handled count, if the peer reported one
        h: Option<u32>,
        /// Stanza error condition name, e.g. `item-not-found`
        condition: Option<String>,
    },
    /// `<r/>`: acknowledgment request
    Request,
    /// `<a/>`: acknowledgment
    Ack {
        /// Inbound stanzas handled by the sender of the ack
        h: u32,
    },
}

impl Nonza {
    /// Element name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Nonza::Enable { .. } => "enable",
            Nonza::Enabled { .. } => "enabled",
            Nonza::Resume { .. } => "resume",
            Nonza::Resumed { .. } => "resumed",
            Nonza::Failed { .. } => "failed",
            Nonza::Request => "r",
            Nonza::Ack { .. } => "a",
        }
    }

    /// Build the XML element for this nonza
    pub fn to_element(&self) -> Element {
        let builder = Element::builder(self.name(), NS_SM);
        match self {
            Nonza::Enable { resume } => {
                if *resume {
                    builder.attr("resume", "true").build()
                } else {
                    builder.build()
                }
            }
            Nonza::Enabled { id, max, resume } => {
                let mut builder = builder;
                if let Some(id) = id {
                    builder = builder.attr("id", id.as_str());
                }
                if let Some(max) = max {
                    builder = builder.attr("max", max.to_string());
                }
                if *resume {
                    builder = builder.attr("resume", "true");
                }
                builder.build()
            }
            Nonza::Resume { h, previd } => builder
                .attr("h", h.to_string())
                .attr("previd", previd.as_str())
                .build(),
            Nonza::Resumed { h, previd } => {
                let mut builder = builder;
                if let Some(h) = h {
                    builder = builder.attr("h", h.to_string());
                }
                if let Some(previd) = previd {
                    builder = builder.attr("previd", previd.as_str());
                }
                builder.build()
            }
            Nonza::Failed { h, condition } => {
                let mut builder = builder;
                if let Some(h) = h {
                    builder = builder.attr("h", h.to_string());
                }
                if let Some(condition) = condition {
                    builder = builder.append(Element::builder(condition.as_str(), NS_STANZAS).build());
                }
                builder.build()
            }
            Nonza::Request => builder.build(),
            Nonza::Ack { h } => builder.attr("h", h.to_string()).build(),
        }
    }
}

impl fmt::Display for Nonza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}/>", self.name())
    }
}

impl TryFrom<&Element> for Nonza {
    type Error = WireError;

    fn try_from(element: &Element) -> Result<Self, Self::Error> {
        if !element.has_ns(NS_SM) {
            return Err(WireError::WrongNamespace {
                name: element.name().to_string(),
                ns: element.ns(),
            });
        }

        match element.name() {
            "enable" => Ok(Nonza::Enable {
                resume: parse_bool(element.attr("resume")),
            }),
            "enabled" => Ok(Nonza::Enabled {
                id: element.attr("id").map(str::to_string),
                max: optional_u32(element, "enabled", "max")?,
                resume: parse_bool(element.attr("resume")),
            }),
            "resume" => Ok(Nonza::Resume {
                h: required_u32(element, "resume", "h")?,
                previd: element
                    .attr("previd")
                    .map(str::to_string)
                    .ok_or(WireError::MissingAttribute {
                        element: "resume",
                        attr: "previd",
                    })?,
            }),
            "resumed" => Ok(Nonza::Resumed {
                h: optional_u32(element, "resumed", "h")?,
                previd: element.attr("previd").map(str::to_string),
            }),
            "failed" => Ok(Nonza::Failed {
                h: optional_u32(element, "failed", "h")?,
                condition: element
                    .children()
                    .find(|child| child.has_ns(NS_STANZAS) && child.name() != "text")
                    .map(|child| child.name().to_string()),
            }),
            "r" => Ok(Nonza::Request),
            "a" => Ok(Nonza::Ack {
                h: required_u32(element, "a", "h")?,
            }),
            other => Err(WireError::UnknownElement(other.to_string())),
        }
    }
}

impl From<&Nonza> for Element {
    fn from(nonza: &Nonza) -> Self {
        nonza.to_element()
    }
}

impl From<Nonza> for Element {
    fn from(nonza: Nonza) -> Self {
        nonza.to_element()
    }
}

/// Build `<enable/>`
pub fn enable(resume: bool) -> Element {
    Nonza::Enable { resume }.to_element()
}

/// Build `<resume h=.. previd=../>`
pub fn resume(h: u32, previd: &str) -> Element {
    Nonza::Resume {
        h,
        previd: previd.to_string(),
    }
    .to_element()
}

/// Build `<r/>`
pub fn request() -> Element {
    Nonza::Request.to_element()
}

/// Build `<a h=../>`
pub fn ack(h: u32) -> Element {
    Nonza::Ack { h }.to_element()
}

// XML Schema booleans: "true" and "1"
fn parse_bool(value: Option<&str>) -> bool {
    matches!(value, Some("true") | Some("1"))
}

fn optional_u32(
    element: &Element,
    name: &'static str,
    attr: &'static str,
) -> Result<Option<u32>, WireError> {
    match element.attr(attr) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|e| {
                debug!("Bad <{}/> {}={:?}: {}", name, attr, raw, e);
                WireError::InvalidAttribute {
                    element: name,
                    attr,
                    value: raw.to_string(),
                }
            }),
    }
}

fn required_u32(element: &Element, name: &'static str, attr: &'static str) -> Result<u32, WireError> {
    optional_u32(element, name, attr)?.ok_or(WireError::MissingAttribute {
        element: name,
        attr,
    })
}
