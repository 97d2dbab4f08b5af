use crate::error::{RelayError, RelayResult};
use crate::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;
use crate::multiplexer::ChannelMultiplexer;
use crate::session::{FrameStream, Session};
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub heartbeat_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamRequest<'a> {
    pub accept: Option<&'a str>,
    pub requested_with: Option<&'a str>,
}

impl<'a> StreamRequest<'a> {
    pub fn new(accept: Option<&'a str>) -> Self {
        Self {
            accept,
            requested_with: None,
        }
    }

    pub fn requested_with(mut self, value: Option<&'a str>) -> Self {
        self.requested_with = value;
        self
    }
}

#[derive(Default)]
pub struct RelayBuilder {
    config: RelayConfig,
    multiplexer: Option<Arc<dyn ChannelMultiplexer>>,
}

impl RelayBuilder {
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn multiplexer(mut self, multiplexer: Arc<dyn ChannelMultiplexer>) -> Self {
        self.multiplexer = Some(multiplexer);
        self
    }

    pub fn build(self) -> RelayResult<Relay> {
        let multiplexer = self
            .multiplexer
            .ok_or(RelayError::MissingDependency("channel multiplexer"))?;
        if self.config.heartbeat_interval.is_zero() {
            return Err(RelayError::InvalidConfig("heartbeat interval must be non-zero"));
        }
        Ok(Relay {
            config: self.config,
            multiplexer,
            session_counter: AtomicU64::new(0),
            open_sessions: Arc::new(AtomicUsize::new(0)),
        })
    }
}

/// Entry point shared by every connection: opens one session per accepted
/// streaming request against the shared multiplexer.
pub struct Relay {
    config: RelayConfig,
    multiplexer: Arc<dyn ChannelMultiplexer>,
    session_counter: AtomicU64,
    open_sessions: Arc<AtomicUsize>,
}

impl Relay {
    pub fn builder() -> RelayBuilder {
        RelayBuilder::default()
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    fn next_session_id(&self) -> String {
        let id = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("sse-{id}")
    }

    /// Opens a streaming session for `channel`. On error nothing was
    /// registered and the caller must answer with `RelayError::status_code`.
    pub fn open(
        &self,
        channel: &str,
        request: StreamRequest<'_>,
    ) -> RelayResult<(Session, FrameStream)> {
        let (mut session, frames) = Session::new(
            self.next_session_id(),
            channel,
            self.multiplexer.clone(),
            self.config.heartbeat_interval,
            self.open_sessions.clone(),
        );
        if let Err(err) = session.negotiate(request.accept, request.requested_with) {
            info!(
                event = "session_rejected",
                session_id = %session.id(),
                channel = channel,
                error = %err
            );
            return Err(err);
        }
        session.begin_streaming()?;
        Ok((session, frames))
    }
}
