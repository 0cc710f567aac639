pub mod db_sessions;
pub mod entity;
pub mod idle;
pub mod lifecycle;
pub mod prompts;
pub mod repository;
pub mod service;
pub mod validation;

pub use entity::{
    ChatScope, ContinueOutcome, ContinueSessionRequest, CreateSessionRequest, MessageDirection,
    Session, SessionInfo, SessionMember, SessionMessage, SessionRole, SessionStatus,
};
pub use idle::{IdlePlan, SweepReport};
pub use lifecycle::TeardownReport;
pub use repository::SessionDbManager;
pub use service::{RecoveryReport, SessionManager, ShutdownReport};
