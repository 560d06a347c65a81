//! 会话存储层：会话记录、持久化后端、会话锁、带并发控制的读改写

pub mod backend;
pub mod locks;
pub mod store;
pub mod types;

pub use backend::{MemoryBackend, SessionBackend, SqliteBackend};
pub use locks::{SessionLocks, WorkflowLockGuard};
pub use store::{SessionStore, WorkflowStateMutator, WORKFLOW_STATE_KEY};
pub use types::{now_micros, Session};
