//! Collaborator seams. The link core never touches a document tree; it
//! hands payloads and directives across these traits.

/// Opaque handle naming where a response should be applied. Resolved by
/// the render collaborator; the link layer never dereferences it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetHandle(pub String);

impl From<&str> for TargetHandle {
    fn from(value: &str) -> Self {
        TargetHandle(value.to_string())
    }
}

impl From<String> for TargetHandle {
    fn from(value: String) -> Self {
        TargetHandle(value)
    }
}

/// How a response payload should be swapped into the document.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapDirectives {
    pub style: String,
    pub swap_delay_ms: u64,
    pub settle_delay_ms: u64,
    pub ignore_title: bool,
}

impl Default for SwapDirectives {
    fn default() -> Self {
        Self {
            style: "innerHTML".to_string(),
            swap_delay_ms: 0,
            settle_delay_ms: 20,
            ignore_title: false,
        }
    }
}

/// Applies an opaque response payload into the document. Implementations
/// own the target lookup table and all before/after lifecycle events.
pub trait RenderSink: Send + Sync {
    fn apply(&self, target: &TargetHandle, payload: &str, swap: &SwapDirectives);
}

/// Session lifecycle notifications, purely observational.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connecting,
    Connected,
    Authenticated { client_id: Option<String> },
    Disconnected { code: Option<u16> },
    TransportError(String),
    ProtocolError(String),
}

pub trait StatusObserver: Send + Sync {
    fn on_event(&self, event: &LinkEvent);
}

/// Default observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl StatusObserver for NullObserver {
    fn on_event(&self, _event: &LinkEvent) {}
}
