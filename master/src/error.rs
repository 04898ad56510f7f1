//! Error taxonomy for the orchestration core.

use shared::{AgentId, ErrorCode, PeerId, RoomId, SpawnStatus, TaskId};

/// Error type for socket setup and the binaries' top level.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("privilege {actual} is below the required {required}")]
    PermissionDenied { required: u32, actual: u32 },

    #[error("peer {0} already registered a spawner")]
    DuplicateRegistration(PeerId),

    #[error("no spawner has a free slot and the spawn queue is full")]
    NoCapacity,

    #[error("task {0} spent too long in the spawn queue")]
    QueueTimeout(TaskId),

    #[error("security code rejected for task {0}")]
    InvalidSecurityCode(TaskId),

    #[error("unknown spawner {0}")]
    UnknownAgent(AgentId),

    #[error("peer {0} has not registered a spawner")]
    NotSpawner(PeerId),

    #[error("unknown spawn task {0}")]
    UnknownTask(TaskId),

    #[error("task {task_id} is {status} and can no longer be cancelled")]
    CannotCancel { task_id: TaskId, status: SpawnStatus },

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: SpawnStatus,
        to: SpawnStatus,
    },

    #[error("peer is not the registered process of task {0}")]
    NotRegistered(TaskId),

    #[error("task {0} is not finalized")]
    NotFinalized(TaskId),

    #[error("task {0} was already finalized")]
    AlreadyFinalized(TaskId),

    #[error("room {0} not found")]
    NotFound(RoomId),

    #[error("access to room {0} denied")]
    Forbidden(RoomId),

    #[error("room {0} is full")]
    Full(RoomId),

    #[error("access grant rejected for room {0}")]
    InvalidGrant(RoomId),
}

impl OrchestratorError {
    /// Stable code sent to peers in `Packet::Error`.
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            OrchestratorError::DuplicateRegistration(_) => ErrorCode::DuplicateRegistration,
            OrchestratorError::NoCapacity => ErrorCode::NoCapacity,
            OrchestratorError::QueueTimeout(_) => ErrorCode::QueueTimeout,
            OrchestratorError::InvalidSecurityCode(_) => ErrorCode::InvalidSecurityCode,
            OrchestratorError::UnknownAgent(_) | OrchestratorError::NotSpawner(_) => {
                ErrorCode::UnknownAgent
            }
            OrchestratorError::UnknownTask(_) => ErrorCode::UnknownTask,
            OrchestratorError::CannotCancel { .. } => ErrorCode::CannotCancel,
            OrchestratorError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            OrchestratorError::NotRegistered(_) => ErrorCode::NotRegistered,
            OrchestratorError::NotFinalized(_) => ErrorCode::NotFinalized,
            OrchestratorError::AlreadyFinalized(_) => ErrorCode::AlreadyFinalized,
            OrchestratorError::NotFound(_) => ErrorCode::NotFound,
            OrchestratorError::Forbidden(_) => ErrorCode::Forbidden,
            OrchestratorError::Full(_) => ErrorCode::Full,
            OrchestratorError::InvalidGrant(_) => ErrorCode::InvalidGrant,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
