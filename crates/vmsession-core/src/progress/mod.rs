//! Progress - 階層的な進捗トラッキング
//!
//! A task tree aggregates progress from leaves to the root:
//! - **FiniteTask**: N equally weighted slots, each pending, done, or a sub-task
//! - **VariableTask**: `current / max` counters (bytes, records, ...)
//! - **BooleanTask**: 0.0 until completed, 1.0 after
//!
//! Notifications travel synchronously from the node that changed up to the
//! root; there is no event queue in between.

mod arena;
mod events;
mod task;
mod tree;

pub use self::events::{ErrorCallback, MessageCallback, ProgressCallback};
pub use self::task::{BooleanTask, FiniteTask, ProgressTask, TaskRef, VariableTask};
pub use self::tree::{TaskKind, TaskSnapshot};
