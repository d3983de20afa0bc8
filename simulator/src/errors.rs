use thiserror::Error;

/// Errors detected before the simulation starts: bad option strings, bad
/// workload or platform documents.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in '{path}': {detail}")]
    Json { path: String, detail: String },
    #[error("invalid YAML in '{path}': {detail}")]
    Yaml { path: String, detail: String },
    #[error("{0}")]
    Schema(String),
    #[error("invalid option '{option}': {detail}")]
    Option { option: String, detail: String },
}

impl ConfigError {
    pub fn schema(detail: impl Into<String>) -> Self {
        ConfigError::Schema(detail.into())
    }

    pub fn option(option: &str, detail: impl Into<String>) -> Self {
        ConfigError::Option {
            option: option.to_string(),
            detail: detail.into(),
        }
    }
}

/// Errors on the decision protocol. All of them are fatal: they indicate a
/// scheduler bug or an incompatible wire version, and continuing would
/// silently corrupt results.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("scheduler transport failed: {0}")]
    Transport(String),
    #[error("invalid JSON message: {0}")]
    Parse(String),
    #[error("invalid JSON message: event {event}: {detail}")]
    Schema { event: usize, detail: String },
    #[error("invalid JSON message: event {event} has an unknown 'type' value '{ty}'")]
    UnknownEvent { event: usize, ty: String },
    #[error("date inconsistency: {date} is before the previous event date {last_date}")]
    DateRegression { date: f64, last_date: f64 },
}

impl ProtocolError {
    pub fn schema(event: usize, detail: impl Into<String>) -> Self {
        ProtocolError::Schema {
            event,
            detail: detail.into(),
        }
    }
}

/// References to jobs or profiles that do not exist, or allocations that do
/// not match the job requirements. Fatal as well.
#[derive(Debug, Error)]
pub enum ReferentialError {
    #[error("job '{0}' does not exist")]
    UnknownJob(String),
    #[error("workload '{0}' does not exist")]
    UnknownWorkload(String),
    #[error("profile '{profile}' does not exist in workload '{workload}'")]
    UnknownProfile { workload: String, profile: String },
    #[error(
        "job '{job}' requests {requested} hosts but the allocation '{alloc}' contains {got}"
    )]
    AllocationMismatch {
        job: String,
        requested: u32,
        got: u32,
        alloc: String,
    },
}

/// Failures while writing a simulator-level snapshot. Unlike the other error
/// kinds these are not fatal: the snapshot is abandoned and the run continues.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
