//! Real-time push infrastructure: the wire event envelope, the per-user
//! connection registry, and the durable task store that backs polling.

pub mod event;
pub mod registry;
pub mod task_store;

pub use event::{EventData, EventKind, GenerationUpdate, Notice, NoticeLevel, PushEvent, UpdateStatus};
pub use registry::{
    spawn_keepalive, ChannelError, ChannelId, ConnectionRegistry, KeepaliveHandle, PushChannel,
};
pub use task_store::{TaskSnapshot, TaskStore};
