use std::fmt;

/// Error taxonomy shared by every layer of the engine. Tool and HTTP
/// surfaces collapse it further; repositories and the service speak it
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgs,
    NotFound,
    Conflict,
    PreconditionFailed,
    Transient,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgs => "invalid_args",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation tag attached by repositories so callers can log what failed
/// without the driver message leaking into user-visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpContext {
    pub op: &'static str,
    pub entity: &'static str,
    pub entity_id: Option<String>,
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_id {
            Some(id) => write!(f, "{} {} {}", self.op, self.entity, id),
            None => write!(f, "{} {}", self.op, self.entity),
        }
    }
}

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    transient: bool,
    context: Option<OpContext>,
    #[source]
    source: Option<BoxedSource>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            transient: kind == ErrorKind::Transient,
            context: None,
            source: None,
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }

    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{} {} not found", entity, id))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionFailed, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_context(
        mut self,
        op: &'static str,
        entity: &'static str,
        entity_id: Option<String>,
    ) -> Self {
        // Keep the innermost tag; it names the statement that actually failed.
        if self.context.is_none() {
            self.context = Some(OpContext {
                op,
                entity,
                entity_id,
            });
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn context(&self) -> Option<&OpContext> {
        self.context.as_ref()
    }

    /// Full diagnostic line for logs: context, message and the driver cause.
    pub fn detail(&self) -> String {
        let mut out = String::new();
        if let Some(ctx) = &self.context {
            out.push_str(&format!("[{}] ", ctx));
        }
        out.push_str(&self.message);
        if let Some(source) = &self.source {
            out.push_str(&format!(": {}", source));
        }
        out
    }
}

pub trait ResultExt<T> {
    fn op_context(
        self,
        op: &'static str,
        entity: &'static str,
        entity_id: Option<String>,
    ) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn op_context(
        self,
        op: &'static str,
        entity: &'static str,
        entity_id: Option<String>,
    ) -> Result<T> {
        self.map_err(|e| e.with_context(op, entity, entity_id))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::internal("failed to encode or decode JSON value").with_source(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => {
                ErrorKind::Transient
            }
            _ => ErrorKind::Internal,
        };
        Error::new(kind, "filesystem operation failed").with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_flag_follows_kind() {
        assert!(Error::transient("pool closed").is_transient());
        assert!(!Error::conflict("duplicate").is_transient());
    }

    #[test]
    fn display_hides_source_and_context() {
        let err = Error::internal("failed to load run")
            .with_source(std::io::Error::other("SELECT * FROM runs exploded"))
            .with_context("get", "run", Some("abc".into()));
        assert_eq!(err.to_string(), "failed to load run");
        assert!(err.detail().contains("SELECT"));
        assert!(err.detail().starts_with("[get run abc]"));
    }

    #[test]
    fn innermost_context_wins() {
        let err = Error::not_found("run", "r1")
            .with_context("get", "run", Some("r1".into()))
            .with_context("approve", "run", Some("r1".into()));
        assert_eq!(err.context().map(|c| c.op), Some("get"));
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PreconditionFailed).unwrap();
        assert_eq!(json, "\"precondition_failed\"");
    }
}
