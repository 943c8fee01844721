use rusqlite;
use std::fmt;
use std::io;
use thiserror::Error;

/// Stable reason carried by every domain error.
///
/// The `code()` strings are part of the CLI contract and must not change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    EmptyModuleList,
    PayloadCountMismatch { modules: usize, payloads: usize },
    UnknownModule(String),
    NamespaceCollision(String),
    OperationCollision(String),
    MalformedPayload(String),
    InvalidAddress(String),
    InvalidRole,
    InvalidQuorum,
    OnlyAdmin,
    OnlyMember,
    ClaimantCannotVote,
    AlreadyInitialized,
    NotInitialized,
    AlreadyMember,
    AlreadyRequested,
    NotMember,
    NotPending,
    AlreadyVoted,
    QueryDepthExceeded,
    UnknownOperation(String),
    NoRequest,
    UnknownClaim(u64),
    UnknownInstance(String),
}

impl Reason {
    pub fn code(&self) -> &'static str {
        match self {
            Reason::EmptyModuleList => "empty_module_list",
            Reason::PayloadCountMismatch { .. } => "payload_count_mismatch",
            Reason::UnknownModule(_) => "unknown_module",
            Reason::NamespaceCollision(_) => "namespace_collision",
            Reason::OperationCollision(_) => "operation_collision",
            Reason::MalformedPayload(_) => "malformed_payload",
            Reason::InvalidAddress(_) => "invalid_address",
            Reason::InvalidRole => "invalid_role",
            Reason::InvalidQuorum => "invalid_quorum",
            Reason::OnlyAdmin => "only_admin",
            Reason::OnlyMember => "only_member",
            Reason::ClaimantCannotVote => "claimant_cannot_vote",
            Reason::AlreadyInitialized => "already_initialized",
            Reason::NotInitialized => "not_initialized",
            Reason::AlreadyMember => "already_member",
            Reason::AlreadyRequested => "already_requested",
            Reason::NotMember => "not_member",
            Reason::NotPending => "not_pending",
            Reason::AlreadyVoted => "already_voted",
            Reason::QueryDepthExceeded => "query_depth_exceeded",
            Reason::UnknownOperation(_) => "unknown_operation",
            Reason::NoRequest => "no_request",
            Reason::UnknownClaim(_) => "unknown_claim",
            Reason::UnknownInstance(_) => "unknown_instance",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::PayloadCountMismatch { modules, payloads } => write!(
                f,
                "{} ({} modules, {} init payloads)",
                self.code(),
                modules,
                payloads
            ),
            Reason::UnknownModule(detail)
            | Reason::NamespaceCollision(detail)
            | Reason::OperationCollision(detail)
            | Reason::MalformedPayload(detail)
            | Reason::InvalidAddress(detail)
            | Reason::UnknownOperation(detail)
            | Reason::UnknownInstance(detail) => write!(f, "{}: {}", self.code(), detail),
            Reason::UnknownClaim(id) => write!(f, "{}: {}", self.code(), id),
            _ => f.write_str(self.code()),
        }
    }
}

#[derive(Error, Debug)]
pub enum CharterError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(Reason),
    #[error("Authorization error: {0}")]
    AuthorizationError(Reason),
    #[error("State error: {0}")]
    StateError(Reason),
    #[error("Not found: {0}")]
    NotFound(Reason),
}

impl CharterError {
    /// Error category as reported to callers.
    pub fn category(&self) -> &'static str {
        match self {
            CharterError::ValidationError(_) => "validation",
            CharterError::AuthorizationError(_) => "authorization",
            CharterError::StateError(_) => "state",
            CharterError::NotFound(_) => "not_found",
            CharterError::RusqliteError(_)
            | CharterError::IoError(_)
            | CharterError::JsonError(_)
            | CharterError::ConfigError(_) => "internal",
        }
    }

    pub fn reason(&self) -> Option<&Reason> {
        match self {
            CharterError::ValidationError(r)
            | CharterError::AuthorizationError(r)
            | CharterError::StateError(r)
            | CharterError::NotFound(r) => Some(r),
            _ => None,
        }
    }

    /// Stable machine code; infrastructure errors share the category name.
    pub fn code(&self) -> &'static str {
        self.reason().map(Reason::code).unwrap_or(self.category())
    }
}
