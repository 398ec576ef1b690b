//! Domain model (IDs, session states, status codes).

pub mod ids;
pub mod state;
pub mod status;

pub use ids::SessionId;
pub use state::{SessionState, UnknownState};
pub use status::HvStatus;
