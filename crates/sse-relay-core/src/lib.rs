pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod multiplexer;
pub mod relay;
pub mod session;

pub use error::{RelayError, RelayResult};
pub use frame::{encode_data, encode_heartbeat, EventFramer, HEARTBEAT_FRAME};
pub use heartbeat::{HeartbeatTimer, DEFAULT_HEARTBEAT_INTERVAL};
pub use multiplexer::{
    ChannelMultiplexer, ListenerId, LocalMultiplexer, MessageListener, MultiplexerStats,
};
pub use relay::{Relay, RelayBuilder, RelayConfig, StreamRequest};
pub use session::{
    FrameStream, Session, SessionEvent, SessionState, EVENT_STREAM, STREAM_HEADERS,
    XHR_REQUESTED_WITH,
};
