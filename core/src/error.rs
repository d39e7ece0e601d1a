use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    /// Schema declaration problem: unresolved table/relation/field reference,
    /// duplicate primary key, and the like. Surfaced at graph-build time.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Query cannot be planned: issued against a non-root node, or references
    /// a field/filter that does not resolve. Surfaced before any round trip.
    #[error("Plan error: {0}")]
    Plan(String),

    /// A cross-partition filter uses an operator/shape the correlator cannot
    /// rewrite into literals. Never silently degrades to a wrong query.
    #[error("Unsupported hydration: {0}")]
    UnsupportedHydration(String),

    /// A fetch-exactly-one query matched zero rows.
    #[error("No rows found")]
    NotFound,

    /// Error executing a statement against storage.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Error converting between rows, values and model objects.
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Error with transaction handling.
    #[error("Transaction error: {0}")]
    Transaction(String),
}

/// Result type for planner and adapter operations
pub type Result<T> = std::result::Result<T, TrellisError>;
