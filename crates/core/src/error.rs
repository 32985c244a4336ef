//! Errors raised by the domain rules in this crate.

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A caller-supplied value is outside its allowed range or vocabulary.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A JSON column persisted on a row no longer decodes.
    #[error("Stored {column} could not be decoded: {source}")]
    UnreadableStored {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
