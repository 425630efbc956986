// Kernel - the task engine and its supporting infrastructure.
//
// The Engine owns the store connection and the background services; the
// HTTP layer only ever talks to it. Everything below `tasks` is engine
// internals.

pub mod engine;
pub mod stream_hub;
pub mod tasks;

pub use engine::{Engine, EngineHealth, HealthStatus, NewTask, StoreStatus, TaskStats};
pub use stream_hub::StreamHub;
