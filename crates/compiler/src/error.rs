use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The syntax tree contains a shape the converter cannot lower.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    /// A stage met IR that an earlier stage should never have produced.
    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(String),
}

impl Error {
    pub fn malformed(message: impl Into<String>) -> Box<Self> {
        Box::new(Error::MalformedInput(message.into()))
    }

    pub fn invariant(message: impl Into<String>) -> Box<Self> {
        Box::new(Error::InternalInvariantViolation(message.into()))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InternalInvariantViolation(_))
    }
}
