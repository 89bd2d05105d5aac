//! Stanza parsing errors

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StanzaError {
    /// XML could not be parsed
    #[error("malformed xml: {0}")]
    Malformed(String),

    /// Required attribute missing
    #[error("missing attribute: {0}")]
    MissingAttribute(String),

    /// Required child element missing
    #[error("missing element: {0}")]
    MissingElement(String),

    /// Attribute or text content had an unexpected value
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Base64 content could not be decoded
    #[error("invalid base64 in {0}")]
    InvalidBase64(String),
}

impl From<roxmltree::Error> for StanzaError {
    fn from(e: roxmltree::Error) -> Self {
        StanzaError::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StanzaError>;
