//! Event-to-SSE bridging: encoding, sinks, and the bridge state machine.

mod bridge;
mod event;
mod sink;
mod sse;

pub use bridge::{
    AbortSignal, BridgeReport, StreamBridge, StreamState, TerminalCause, IDLE_TIMEOUT_MESSAGE,
    PRODUCER_GONE_MESSAGE, SHUTDOWN_MESSAGE,
};
pub use event::{event_channel, EventHandler, EventReceiver, EventSender, StreamEvent, Token};
pub use sink::{ChannelSink, IoSink, StreamSink};
pub use sse::{encode, format_error_response, SSE_HEADERS};
