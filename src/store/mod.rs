pub mod cache;
pub mod task;

pub use cache::{CacheHit, CacheStore};
pub use task::{JobInfo, RemoteTask, SetKind, SubmitMethod, Tag, TaskStore};
