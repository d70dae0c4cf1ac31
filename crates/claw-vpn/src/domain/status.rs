//! Persisted status rows written by the statistics collector.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Handshakes older than this no longer count as an active connection.
pub const HANDSHAKE_STALENESS: Duration = Duration::from_secs(120);

/// Whether `at` lies within [`HANDSHAKE_STALENESS`] before `now`.
///
/// Timestamps in the future count as recent.
pub fn is_recent(at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match (now - at).to_std() {
        Ok(age) => age < HANDSHAKE_STALENESS,
        Err(_) => true,
    }
}

/// Last observed state of a peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerStatus {
    /// Peer identifier.
    pub peer_id: String,
    /// When the row was written.
    pub updated_at: DateTime<Utc>,
    /// Derived from pingability and handshake age.
    pub is_connected: bool,
    /// Last probe was answered.
    pub is_pingable: bool,
    /// Time of the last probe.
    pub last_ping: Option<DateTime<Utc>>,
    /// Bytes the peer sent.
    pub bytes_received: u64,
    /// Bytes the peer received.
    pub bytes_transmitted: u64,
    /// Last completed handshake.
    pub last_handshake: Option<DateTime<Utc>>,
    /// Endpoint the peer was last seen at.
    pub endpoint: String,
    /// Start of the current session.
    pub last_session_start: Option<DateTime<Utc>>,
}

impl PeerStatus {
    /// Empty row for `peer_id`.
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            ..Self::default()
        }
    }

    /// Recomputes `is_connected` against `now`.
    pub fn calc_connected(&mut self, now: DateTime<Utc>) {
        let recent = self.last_handshake.is_some_and(|hs| is_recent(hs, now));
        self.is_connected = self.is_pingable || recent;
    }
}

/// Last observed counters of an interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceStatus {
    /// Interface identifier.
    pub interface_id: String,
    /// When the row was written.
    pub updated_at: DateTime<Utc>,
    /// Bytes received by the device.
    pub bytes_received: u64,
    /// Bytes sent by the device.
    pub bytes_transmitted: u64,
}

impl InterfaceStatus {
    /// Empty row for `interface_id`.
    pub fn new(interface_id: impl Into<String>) -> Self {
        Self {
            interface_id: interface_id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn connected_when_pingable_or_recent_handshake() {
        let now = Utc::now();
        let mut status = PeerStatus::new("p");
        status.calc_connected(now);
        assert!(!status.is_connected);

        status.last_handshake = Some(now - Duration::seconds(30));
        status.calc_connected(now);
        assert!(status.is_connected);

        status.last_handshake = Some(now - Duration::minutes(5));
        status.calc_connected(now);
        assert!(!status.is_connected);

        status.is_pingable = true;
        status.calc_connected(now);
        assert!(status.is_connected);
    }
}
