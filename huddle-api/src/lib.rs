// Huddle API Library
//
// HTTP endpoints and the signaling WebSocket in front of the SFU

pub mod http;

// Re-export commonly used types
pub use http::{create_router, AppState};
