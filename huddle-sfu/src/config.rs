//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Capacity of each connection's outbound message queue
    pub outbound_queue_capacity: usize,
    /// Close transports that are never connected within this many seconds (0 = never)
    pub transport_idle_timeout_secs: u64,
    /// Destroy rooms that stay without peers and producers for this many seconds
    pub empty_room_grace_secs: u64,
    /// Interval of the background sweep (0 = no background sweep)
    pub sweep_interval_secs: u64,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            max_peers_per_room: 50,
            outbound_queue_capacity: 256,
            transport_idle_timeout_secs: 60,
            empty_room_grace_secs: 300,
            sweep_interval_secs: 15,
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub fn transport_idle_timeout(&self) -> Option<Duration> {
        (self.transport_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.transport_idle_timeout_secs))
    }

    #[must_use]
    pub const fn empty_room_grace(&self) -> Duration {
        Duration::from_secs(self.empty_room_grace_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_disables_timers() {
        let config = SfuConfig {
            transport_idle_timeout_secs: 0,
            sweep_interval_secs: 0,
            ..SfuConfig::default()
        };
        assert_eq!(config.transport_idle_timeout(), None);
        assert_eq!(config.sweep_interval(), None);

        let defaults = SfuConfig::default();
        assert_eq!(defaults.transport_idle_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(defaults.sweep_interval(), Some(Duration::from_secs(15)));
        assert_eq!(defaults.empty_room_grace(), Duration::from_secs(300));
    }
}
