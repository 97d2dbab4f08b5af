use crate::error::{RelayError, RelayResult};
use crate::frame::EventFramer;
use crate::heartbeat::HeartbeatTimer;
use crate::multiplexer::{ChannelMultiplexer, ListenerId, MessageListener};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const EVENT_STREAM: &str = "text/event-stream";
pub const XHR_REQUESTED_WITH: &str = "XMLHttpRequest";

pub const STREAM_HEADERS: [(&str, &str); 3] = [
    ("content-type", EVENT_STREAM),
    ("cache-control", "no-cache"),
    ("connection", "keep-alive"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    MessageReceived(Option<String>),
    HeartbeatFired,
    ConnectionClosed,
}

/// Bridges multiplexer notifications into one session's inbox, keeping only
/// the session's own channel.
struct ChannelListener {
    channel: String,
    inbox: mpsc::UnboundedSender<Option<String>>,
}

impl MessageListener for ChannelListener {
    fn notify(&self, channel: &str, payload: Option<&str>) {
        if channel == self.channel {
            let _ = self.inbox.send(payload.map(str::to_string));
        }
    }
}

/// Receiving half of a session's connection: every frame the session writes,
/// in order. Dropping it is how the HTTP layer signals that the client left.
#[derive(Debug)]
pub struct FrameStream {
    frames: mpsc::UnboundedReceiver<String>,
}

impl FrameStream {
    pub async fn next_frame(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    pub fn try_next_frame(&mut self) -> Option<String> {
        self.frames.try_recv().ok()
    }
}

pub struct Session {
    id: String,
    channel: String,
    state: SessionState,
    polyfill: bool,
    framer: EventFramer,
    listener: Option<ListenerId>,
    inbox: mpsc::UnboundedReceiver<Option<String>>,
    inbox_tx: Option<mpsc::UnboundedSender<Option<String>>>,
    multiplexer: Arc<dyn ChannelMultiplexer>,
    open_sessions: Arc<AtomicUsize>,
    frames_written: u64,
}

impl Session {
    pub(crate) fn new(
        id: String,
        channel: &str,
        multiplexer: Arc<dyn ChannelMultiplexer>,
        heartbeat_interval: Duration,
        open_sessions: Arc<AtomicUsize>,
    ) -> (Self, FrameStream) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let session = Self {
            id,
            channel: channel.to_string(),
            state: SessionState::Idle,
            polyfill: false,
            framer: EventFramer::new(frames_tx, HeartbeatTimer::new(heartbeat_interval)),
            listener: None,
            inbox,
            inbox_tx: Some(inbox_tx),
            multiplexer,
            open_sessions,
            frames_written: 0,
        };
        (session, FrameStream { frames: frames_rx })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_polyfill(&self) -> bool {
        self.polyfill
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn heartbeat(&self) -> &HeartbeatTimer {
        self.framer.heartbeat()
    }

    /// Checks the declared media type. A mismatch closes the session before
    /// anything is registered.
    pub(crate) fn negotiate(
        &mut self,
        accept: Option<&str>,
        requested_with: Option<&str>,
    ) -> RelayResult<()> {
        if self.state != SessionState::Idle {
            return Err(RelayError::InvalidTransition {
                from: self.state,
                to: SessionState::Negotiating,
            });
        }
        self.state = SessionState::Negotiating;
        if accept != Some(EVENT_STREAM) {
            self.state = SessionState::Closed;
            return Err(RelayError::NotAcceptable {
                accept: accept.map(str::to_string),
            });
        }
        if self.channel.is_empty() {
            self.state = SessionState::Closed;
            return Err(RelayError::InvalidChannel(self.channel.clone()));
        }
        self.polyfill = requested_with == Some(XHR_REQUESTED_WITH);
        Ok(())
    }

    /// Commits the connection to streaming: registers with the multiplexer
    /// and arms the heartbeat.
    pub(crate) fn begin_streaming(&mut self) -> RelayResult<()> {
        let refused = RelayError::InvalidTransition {
            from: self.state,
            to: SessionState::Streaming,
        };
        if self.state != SessionState::Negotiating {
            return Err(refused);
        }
        let Some(inbox) = self.inbox_tx.take() else {
            return Err(refused);
        };
        self.state = SessionState::Streaming;
        self.open_sessions.fetch_add(1, Ordering::SeqCst);

        self.multiplexer.subscribe(&self.channel);
        let listener = self.multiplexer.add_listener(Arc::new(ChannelListener {
            channel: self.channel.clone(),
            inbox,
        }));
        self.listener = Some(listener);
        self.framer.heartbeat_mut().start();

        info!(
            event = "session_open",
            session_id = %self.id,
            channel = %self.channel,
            listener = %listener,
            polyfill = self.polyfill
        );
        Ok(())
    }

    /// Applies one event. Returns the state after the event was handled.
    pub fn handle(&mut self, event: SessionEvent) -> SessionState {
        if self.state != SessionState::Streaming {
            if event == SessionEvent::ConnectionClosed {
                self.teardown("connection_closed");
            }
            return self.state;
        }

        let written = match event {
            SessionEvent::MessageReceived(payload) => self.framer.write_data(payload.as_deref()),
            SessionEvent::HeartbeatFired => self.framer.write_heartbeat(),
            SessionEvent::ConnectionClosed => {
                self.teardown("connection_closed");
                return self.state;
            }
        };

        match written {
            Ok(()) => self.frames_written += 1,
            Err(err) => {
                warn!(
                    event = "frame_write_failed",
                    session_id = %self.id,
                    channel = %self.channel,
                    error = %err
                );
                self.teardown("write_failure");
            }
        }
        self.state
    }

    pub fn close(&mut self) {
        self.handle(SessionEvent::ConnectionClosed);
    }

    /// Drives the session until the connection goes away. Message delivery,
    /// heartbeat firing and close detection all funnel through `handle`, so
    /// they never overlap.
    pub async fn run(mut self) {
        while self.state == SessionState::Streaming {
            let event = tokio::select! {
                biased;
                _ = self.framer.connection_closed() => SessionEvent::ConnectionClosed,
                payload = self.inbox.recv() => match payload {
                    Some(payload) => SessionEvent::MessageReceived(payload),
                    None => SessionEvent::ConnectionClosed,
                },
                _ = self.framer.heartbeat().fired() => SessionEvent::HeartbeatFired,
            };
            debug!(event = "session_event", session_id = %self.id, kind = ?event);
            self.handle(event);
        }
    }

    fn teardown(&mut self, reason: &'static str) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_streaming = self.state == SessionState::Streaming;
        self.state = SessionState::Closed;
        self.framer.heartbeat_mut().cancel();
        if let Some(listener) = self.listener.take() {
            self.multiplexer.unsubscribe(&self.channel);
            self.multiplexer.remove_listener(listener);
        }
        self.inbox_tx = None;
        if was_streaming {
            self.open_sessions.fetch_sub(1, Ordering::SeqCst);
            info!(
                event = "session_closed",
                session_id = %self.id,
                channel = %self.channel,
                reason = reason,
                frames = self.frames_written
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown("dropped");
    }
}
