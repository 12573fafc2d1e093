//! Task records: the unit of schedulable work and its lifecycle.
//!
//! - `state`: status machine (Pending → Running → Completed/Failed)
//! - `model`: the serializable `TaskRecord`
//! - `queue`: producer-side API for enqueueing and inspecting records

pub mod model;
pub mod queue;
pub mod state;

pub use model::{NewTask, TaskKind, TaskProgress, TaskRecord};
pub use queue::{QueueStats, TaskQueue};
pub use state::TaskStatus;
