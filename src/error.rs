use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpiceBatchError {
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    #[error("Parameter not found: {0}")]
    ParameterNotFound(String),

    #[error("Directive not found: {0}")]
    DirectiveNotFound(String),

    #[error("Unrecognized {kind} line format: {line}")]
    UnrecognizedFormat { kind: char, line: String },

    #[error("Unsupported element type '{0}'")]
    UnsupportedElementType(char),

    #[error("Invalid engineering value: {0}")]
    InvalidValue(String),

    #[error("Scheduling refused for run {seq}: no free slot within the wait timeout")]
    SchedulingRefusal { seq: u64 },

    #[error("Timed out waiting for {active} active simulation(s)")]
    TaskTimeout { active: usize },

    #[error("Unknown simulation run {0}")]
    UnknownTask(u64),

    #[error("Simulation {seq} failed: {detail}")]
    ExternalProcessFailure { seq: u64, detail: String },

    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpiceBatchError>;
