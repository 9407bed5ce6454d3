use std::time::Duration;

use pvwire_frame::DEFAULT_MAX_MESSAGE_SIZE;
use pvwire_transport::PvaSettings;

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the send queue. Submissions beyond it fail immediately.
    pub send_queue_capacity: usize,
    /// Receive buffer size advertised to the peer during validation.
    pub receive_buffer_size: usize,
    /// Initial capacity of the send buffer.
    pub send_buffer_size: usize,
    /// Largest message, or reassembled segmented message, accepted.
    pub max_message_size: usize,
    /// Bound on each thread join during `close`.
    pub shutdown_timeout: Duration,
    /// Timeout for establishing the TCP connection.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: pvwire_transport::settings::DEFAULT_SEND_QUEUE_SIZE,
            receive_buffer_size: pvwire_transport::settings::DEFAULT_TCP_BUFFER_SIZE,
            send_buffer_size: pvwire_transport::settings::DEFAULT_TCP_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            shutdown_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// Derive connection settings from process settings.
    pub fn from_settings(settings: &PvaSettings) -> Self {
        Self {
            send_queue_capacity: settings.send_queue_size,
            receive_buffer_size: settings.tcp_buffer_size,
            send_buffer_size: settings.tcp_buffer_size,
            connect_timeout: settings.conn_timeout,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_settings() {
        let settings = PvaSettings {
            send_queue_size: 4,
            tcp_buffer_size: 4096,
            conn_timeout: Duration::from_secs(2),
            ..PvaSettings::default()
        };
        let config = ConnectionConfig::from_settings(&settings);
        assert_eq!(config.send_queue_capacity, 4);
        assert_eq!(config.receive_buffer_size, 4096);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }
}
