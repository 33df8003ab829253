//! # Waystation Server
//!
//! The HTTP surface of the control plane: REST handlers under `/api`, the
//! SSE event stream, the credential proxy under `/proxy`, the browser
//! stream WebSocket splice, and the two background tickers (task
//! scheduler and auto-sleep monitor).
//!
//! Handlers are thin: they validate, call a service, and map error kinds
//! to status codes. Business logic lives in `waystation-core` and
//! `waystation-runtime`.

pub mod autosleep;
pub mod browser_stream;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod router;
pub mod scheduler;
pub mod sse;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use router::build_router;
pub use state::AppState;
