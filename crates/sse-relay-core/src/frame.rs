use crate::error::{RelayError, RelayResult};
use crate::heartbeat::HeartbeatTimer;
use tokio::sync::mpsc;

pub const HEARTBEAT_FRAME: &str = ": hb\n\n";
const DATA_FIELD: &str = "data:";

pub fn encode_heartbeat() -> String {
    HEARTBEAT_FRAME.to_string()
}

/// Encodes one payload as a data frame. Absent and empty payloads both
/// produce the bare terminator.
pub fn encode_data(payload: Option<&str>) -> String {
    let mut frame = String::new();
    if let Some(payload) = payload.filter(|value| !value.is_empty()) {
        for line in payload.split('\n') {
            frame.push_str(DATA_FIELD);
            frame.push_str(line.strip_suffix('\r').unwrap_or(line));
            frame.push('\n');
        }
    }
    frame.push('\n');
    frame
}

/// Writes frames to one connection and keeps the heartbeat deadline in step
/// with the last write.
#[derive(Debug)]
pub struct EventFramer {
    connection: mpsc::UnboundedSender<String>,
    heartbeat: HeartbeatTimer,
}

impl EventFramer {
    pub fn new(connection: mpsc::UnboundedSender<String>, heartbeat: HeartbeatTimer) -> Self {
        Self {
            connection,
            heartbeat,
        }
    }

    pub fn write_heartbeat(&mut self) -> RelayResult<()> {
        self.write(encode_heartbeat())
    }

    pub fn write_data(&mut self, payload: Option<&str>) -> RelayResult<()> {
        self.write(encode_data(payload))
    }

    fn write(&mut self, frame: String) -> RelayResult<()> {
        self.heartbeat.reset();
        // The body drains at the client's pace; only a dropped body fails.
        self.connection
            .send(frame)
            .map_err(|_| RelayError::TransportWriteFailure("connection closed"))
    }

    pub fn heartbeat(&self) -> &HeartbeatTimer {
        &self.heartbeat
    }

    pub fn heartbeat_mut(&mut self) -> &mut HeartbeatTimer {
        &mut self.heartbeat
    }

    pub fn is_connection_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub async fn connection_closed(&self) {
        self.connection.closed().await
    }
}
