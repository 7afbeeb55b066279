//! Nerva error types with error codes
//!
//! Error code ranges:
//! - NERVA-000-009: DAG construction errors
//! - NERVA-010-019: Node execution errors
//! - NERVA-020-029: Store errors (memory/threads/graph)
//! - NERVA-030-039: LLM errors
//! - NERVA-040-049: Browser/playbook errors
//! - NERVA-050-059: Dispatch errors
//! - NERVA-060-069: Config/IO errors

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NervaError>;

/// Coarse error taxonomy used by the dispatcher when translating node and
/// collaborator failures into a task outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Timeout,
    Unavailable,
    BadResponse,
    Ambiguous,
    Refused,
    Cancelled,
    Internal,
}

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
///
/// Implements both `thiserror::Error` for std error compatibility
/// and `miette::Diagnostic` for fancy terminal error display.
#[derive(Error, Debug, Diagnostic)]
pub enum NervaError {
    // ═══════════════════════════════════════════
    // DAG CONSTRUCTION (000-009)
    // ═══════════════════════════════════════════
    #[error("[NERVA-001] Cycle detected in DAG '{dag}': {cycle}")]
    #[diagnostic(
        code(nerva::cycle_detected),
        help("Remove circular dependencies between nodes")
    )]
    CycleDetected { dag: String, cycle: String },

    #[error("[NERVA-002] Node '{node}' depends on unknown node '{dep}'")]
    #[diagnostic(code(nerva::missing_dependency))]
    MissingDependency { node: String, dep: String },

    #[error("[NERVA-003] Duplicate node name '{node}' in DAG '{dag}'")]
    #[diagnostic(code(nerva::duplicate_node))]
    DuplicateNode { dag: String, node: String },

    // ═══════════════════════════════════════════
    // NODE EXECUTION (010-019)
    // ═══════════════════════════════════════════
    #[error("[NERVA-010] Node '{node}' failed: {reason}")]
    NodeFailed { node: String, reason: String },

    #[error("[NERVA-011] Node '{node}' timed out after {timeout_ms}ms")]
    NodeTimeout { node: String, timeout_ms: u64 },

    #[error("[NERVA-012] Execution cancelled")]
    Cancelled,

    // ═══════════════════════════════════════════
    // STORES (020-029)
    // ═══════════════════════════════════════════
    #[error("[NERVA-020] Memory item '{id}' not found")]
    MemoryNotFound { id: String },

    #[error("[NERVA-021] Thread '{id}' not found")]
    ThreadNotFound { id: String },

    #[error("[NERVA-022] Entity '{id}' not found in knowledge graph")]
    EntityNotFound { id: String },

    // ═══════════════════════════════════════════
    // LLM (030-039)
    // ═══════════════════════════════════════════
    #[error("[NERVA-030] LLM unavailable: {reason}")]
    #[diagnostic(
        code(nerva::llm_unavailable),
        help("Check ROUTER_URL / LLM_NODES and that the gateway is running")
    )]
    LlmUnavailable { reason: String },

    #[error("[NERVA-031] LLM call timed out after {timeout_ms}ms")]
    LlmTimeout { timeout_ms: u64 },

    #[error("[NERVA-032] LLM returned unparseable output after retry: {snippet}")]
    #[diagnostic(code(nerva::bad_response))]
    BadResponse { snippet: String },

    // ═══════════════════════════════════════════
    // BROWSER / PLAYBOOK (040-049)
    // ═══════════════════════════════════════════
    #[error("[NERVA-040] Selector '{selector}' not found within {timeout_ms}ms")]
    SelectorNotFound { selector: String, timeout_ms: u64 },

    #[error("[NERVA-041] Navigation to '{url}' blocked: {reason}")]
    #[diagnostic(
        code(nerva::navigation_blocked),
        help("Only http:// and https:// URLs are permitted")
    )]
    NavigationBlocked { url: String, reason: String },

    #[error("[NERVA-042] Browser error: {reason}")]
    Browser { reason: String },

    #[error("[NERVA-043] Playbook '{playbook}' failed at step '{step}': {reason}")]
    PlaybookFailed {
        playbook: String,
        step: String,
        reason: String,
    },

    #[error("[NERVA-044] Playbook '{playbook}' postcondition failed: {reason}")]
    PostconditionFailed { playbook: String, reason: String },

    // ═══════════════════════════════════════════
    // DISPATCH (050-059)
    // ═══════════════════════════════════════════
    #[error("[NERVA-050] Request is ambiguous: {question}")]
    Ambiguous { question: String },

    #[error("[NERVA-051] Refused: {reason}")]
    Refused { reason: String },

    #[error("[NERVA-052] Unknown skill '{name}'")]
    UnknownSkill { name: String },

    #[error("[NERVA-053] Dispatcher at capacity, request cancelled while queued")]
    Busy,

    // ═══════════════════════════════════════════
    // CONFIG / IO (060-069)
    // ═══════════════════════════════════════════
    #[error("[NERVA-060] Config error: {reason}")]
    #[diagnostic(
        code(nerva::config),
        help("Check ~/.config/nerva/config.toml and NERVA_* environment variables")
    )]
    Config { reason: String },

    #[error("[NERVA-061] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[NERVA-062] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[NERVA-063] YAML error: {0}")]
    #[diagnostic(
        code(nerva::yaml_parse),
        help("Check YAML syntax: indentation must be consistent")
    )]
    Yaml(#[from] serde_yaml::Error),

    #[error("[NERVA-064] Internal invariant violated: {reason}")]
    Internal { reason: String },
}

impl NervaError {
    /// Get the error code (e.g., "NERVA-001")
    pub fn code(&self) -> &'static str {
        match self {
            Self::CycleDetected { .. } => "NERVA-001",
            Self::MissingDependency { .. } => "NERVA-002",
            Self::DuplicateNode { .. } => "NERVA-003",
            Self::NodeFailed { .. } => "NERVA-010",
            Self::NodeTimeout { .. } => "NERVA-011",
            Self::Cancelled => "NERVA-012",
            Self::MemoryNotFound { .. } => "NERVA-020",
            Self::ThreadNotFound { .. } => "NERVA-021",
            Self::EntityNotFound { .. } => "NERVA-022",
            Self::LlmUnavailable { .. } => "NERVA-030",
            Self::LlmTimeout { .. } => "NERVA-031",
            Self::BadResponse { .. } => "NERVA-032",
            Self::SelectorNotFound { .. } => "NERVA-040",
            Self::NavigationBlocked { .. } => "NERVA-041",
            Self::Browser { .. } => "NERVA-042",
            Self::PlaybookFailed { .. } => "NERVA-043",
            Self::PostconditionFailed { .. } => "NERVA-044",
            Self::Ambiguous { .. } => "NERVA-050",
            Self::Refused { .. } => "NERVA-051",
            Self::UnknownSkill { .. } => "NERVA-052",
            Self::Busy => "NERVA-053",
            Self::Config { .. } => "NERVA-060",
            Self::Io(_) => "NERVA-061",
            Self::Json(_) => "NERVA-062",
            Self::Yaml(_) => "NERVA-063",
            Self::Internal { .. } => "NERVA-064",
        }
    }

    /// Map onto the coarse taxonomy the dispatcher reports.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MemoryNotFound { .. }
            | Self::ThreadNotFound { .. }
            | Self::EntityNotFound { .. }
            | Self::SelectorNotFound { .. }
            | Self::UnknownSkill { .. } => ErrorClass::NotFound,
            Self::NodeTimeout { .. } | Self::LlmTimeout { .. } => ErrorClass::Timeout,
            Self::LlmUnavailable { .. } | Self::Browser { .. } | Self::Busy => {
                ErrorClass::Unavailable
            }
            Self::BadResponse { .. } => ErrorClass::BadResponse,
            Self::Ambiguous { .. } => ErrorClass::Ambiguous,
            Self::Refused { .. } => ErrorClass::Refused,
            Self::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Internal,
        }
    }

    /// Check if error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NodeTimeout { .. }
                | Self::LlmTimeout { .. }
                | Self::LlmUnavailable { .. }
                | Self::SelectorNotFound { .. }
                | Self::Browser { .. }
        )
    }
}

impl FixSuggestion for NervaError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            NervaError::CycleDetected { .. } => {
                Some("Remove circular dependencies between nodes")
            }
            NervaError::MissingDependency { .. } => {
                Some("Add the missing node or fix the dependency name")
            }
            NervaError::NodeTimeout { .. } => Some("Increase the node timeout or split the work"),
            NervaError::LlmUnavailable { .. } => {
                Some("Check ROUTER_URL / LLM_NODES and that the gateway is running")
            }
            NervaError::BadResponse { .. } => {
                Some("The model ignored the JSON instruction twice; try a different model")
            }
            NervaError::SelectorNotFound { .. } => {
                Some("The page layout may have changed; update the playbook selector")
            }
            NervaError::NavigationBlocked { .. } => {
                Some("Only http:// and https:// URLs are permitted")
            }
            NervaError::Refused { .. } => {
                Some("Repeat the request with the word 'confirm' to proceed")
            }
            NervaError::Config { .. } => {
                Some("Check ~/.config/nerva/config.toml and NERVA_* environment variables")
            }
            NervaError::Yaml(_) => Some("Check YAML syntax: indentation and quoting"),
            _ => None,
        }
    }
}
