//! Wire protocol error types.

use thiserror::Error;

/// Stream management wire errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Element is not in the stream management namespace
    #[error("wrong namespace for <{name}/>: {ns}")]
    WrongNamespace {
        /// Element name
        name: String,
        /// Namespace found on the element
        ns: String,
    },

    /// Element name is not a stream management nonza
    #[error("unknown element <{0}/>")]
    UnknownElement(String),

    /// Required attribute missing
    #[error("<{element}/> missing required attribute '{attr}'")]
    MissingAttribute {
        /// Element name
        element: &'static str,
        /// Attribute name
        attr: &'static str,
    },

    /// Attribute present but not parseable
    #[error("<{element}/> has invalid '{attr}' value: {value:?}")]
    InvalidAttribute {
        /// Element name
        element: &'static str,
        /// Attribute name
        attr: &'static str,
        /// Raw attribute value
        value: String,
    },
}
