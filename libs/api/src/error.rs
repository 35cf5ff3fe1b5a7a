//! Error types for declaration parsing and validation.

use thiserror::Error;

/// Errors raised while interpreting a declaration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The quantity string is empty.
    #[error("quantity cannot be empty")]
    EmptyQuantity,

    /// The quantity string could not be parsed.
    #[error("invalid quantity '{value}': {reason}")]
    InvalidQuantity { value: String, reason: &'static str },

    /// A count that must not be negative is.
    #[error("must not be negative, got {value}")]
    Negative { value: i64 },

    /// A declaration field holds an unusable value.
    #[error("invalid field {field}: {source}")]
    InvalidField {
        field: &'static str,
        #[source]
        source: Box<ApiError>,
    },

    /// The object is missing metadata the controller relies on.
    #[error("object {object} is missing {what}")]
    MissingMetadata { object: String, what: &'static str },
}

impl ApiError {
    /// Wrap this error with the name of the declaration field it came from.
    pub fn in_field(self, field: &'static str) -> Self {
        ApiError::InvalidField {
            field,
            source: Box::new(self),
        }
    }
}
