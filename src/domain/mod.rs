// # Broker domain types
//
// The `Session` record is the authoritative unit linking a gateway user, a
// catalog connection and a running VNC workload. A session with no username
// is an unclaimed pool entry.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// TCP port the VNC server listens on inside every workload.
pub const VNC_PORT: u16 = 5901;

/// Length of the random session identifier.
const SESSION_ID_LENGTH: usize = 8;

/// Random bytes behind each VNC password (192 bits, base64url encoded).
const VNC_PASSWORD_BYTES: usize = 24;

/// Authoritative session record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    /// Opaque short random identifier, primary key.
    pub session_id: String,
    /// Owning user; `None` marks an unclaimed pool entry.
    pub username: Option<String>,
    /// Identifier of the gateway catalog entry, once created.
    pub gateway_connection_id: Option<String>,
    /// VNC password, base64url encoded.
    pub vnc_password: Option<String>,
    /// Orchestrator-assigned workload identifier, `None` when no workload.
    pub workload_id: Option<String>,
    /// Workload IP, valid only while `workload_id` refers to a live workload.
    pub workload_ip: Option<String>,
    pub created_at: Option<i64>,
    pub started_at: Option<i64>,
    pub last_activity: Option<i64>,
}

impl Session {
    /// New empty session with a fresh identifier and creation timestamp.
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            created_at: Some(now_epoch()),
            ..Default::default()
        }
    }

    /// True when this row is an unclaimed pool entry.
    pub fn is_pool_entry(&self) -> bool {
        self.username.is_none() && self.workload_id.is_some()
    }

    /// Timestamp used for idle accounting: last activity, falling back to
    /// the workload start time.
    pub fn idle_reference(&self) -> Option<i64> {
        self.last_activity.or(self.started_at)
    }

    /// Clear the workload fields after the workload was destroyed or found
    /// dead. The record itself survives for the next respawn.
    pub fn clear_workload(&mut self) {
        self.workload_id = None;
        self.workload_ip = None;
        self.started_at = None;
    }
}

/// Current time as epoch seconds.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Generate a short random session identifier.
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()[..SESSION_ID_LENGTH].to_string()
}

/// Generate a VNC password: random bytes, URL-safe encoding.
pub fn generate_vnc_password() -> String {
    let bytes = rand::random::<[u8; VNC_PASSWORD_BYTES]>();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_short_and_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), SESSION_ID_LENGTH);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn vnc_password_has_enough_entropy() {
        let pw = generate_vnc_password();
        // 24 bytes -> 32 base64url chars, no padding
        assert_eq!(pw.len(), 32);
        assert!(!pw.contains('='));
        assert_ne!(pw, generate_vnc_password());
    }

    #[test]
    fn pool_entry_detection() {
        let mut s = Session::new(new_session_id());
        assert!(!s.is_pool_entry());
        s.workload_id = Some("w1".into());
        assert!(s.is_pool_entry());
        s.username = Some("alice".into());
        assert!(!s.is_pool_entry());
    }

    #[test]
    fn idle_reference_prefers_last_activity() {
        let mut s = Session::new(new_session_id());
        assert_eq!(s.idle_reference(), None);
        s.started_at = Some(100);
        assert_eq!(s.idle_reference(), Some(100));
        s.last_activity = Some(200);
        assert_eq!(s.idle_reference(), Some(200));
    }
}
