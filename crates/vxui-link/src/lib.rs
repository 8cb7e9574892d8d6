//! Client-side WebSocket transport for vxui UIs.
//!
//! Replaces per-request HTTP with one persistent connection: RPC
//! multiplexing, token authentication, reconnect with full-jitter
//! backoff, heartbeating, and a best-effort script sandbox for
//! backend-issued `run_js` commands.

pub mod config;
pub mod error;
pub mod logging;
pub mod render;
pub mod sandbox;
pub mod session;
pub mod transport;

pub use config::{Config, ReconnectDelay};
pub use error::LinkError;
pub use render::{LinkEvent, NullObserver, RenderSink, StatusObserver, SwapDirectives, TargetHandle};
pub use sandbox::{SandboxError, ScriptEngine, ScriptOutcome};
pub use session::{AuthState, RpcTicket, Session, Submission};
pub use vxui_wire as wire;
