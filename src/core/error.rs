use thiserror::Error;

/// Reasons an input row cannot become a [`Packet`](super::Packet).
///
/// None of these are fatal to a run: the ingest pipeline counts and skips the
/// row.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unparseable {field}: {value:?}")]
    Unparseable { field: &'static str, value: String },

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RecordError>;
