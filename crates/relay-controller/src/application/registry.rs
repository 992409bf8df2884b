//! DeviceRegistry: the controller's authoritative map of known devices.
//!
//! Every target that ever registered (or was discovered) has one
//! [`RegisteredDevice`] entry tracking its identity, connection state,
//! pairing state, and timestamps.
//!
//! # Device lifecycle (for beginners)
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Paired
//!       ▲                             │            │
//!       └───────── disconnect ────────┴────────────┘
//! ```
//!
//! - A record is created on the first `register` message.
//! - Connecting/Connected track the live WebSocket session.
//! - Paired means the one-time pairing token was echoed back in time and an
//!   auth token was issued.  Pairing survives disconnects; connectivity
//!   does not.
//! - Records are removed only by the explicit staleness sweep
//!   ([`DeviceRegistry::cleanup_old_devices`]).
//!
//! # Identity migration
//!
//! A target regenerates its device id on process restart.  To avoid
//! accumulating one dead record per restart, a registration under a *new* id
//! whose `ip` (or `mac`) matches an existing record migrates that record to
//! the new id instead of inserting a duplicate, preserving pairing state and
//! `first_seen`.
//!
//! All operations return structured results; none panic on expected failure
//! paths.  Every mutation emits a [`RegistryEvent`] on the channel handed
//! out by [`DeviceRegistry::new`], so observers (logging, UI) see each
//! transition as a typed notification rather than an untyped blob.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use relay_core::{generate_token, CommandType, DeviceInfo, TOKEN_LEN};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Ephemeral identifier of a live transport session.
pub type ConnectionId = Uuid;

/// Default validity window for a freshly issued pairing token.
pub const DEFAULT_PAIRING_TTL: Duration = Duration::from_secs(300);

/// Connection/pairing status of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Paired,
    Error,
}

/// Registry-owned record wrapping a peer-supplied [`DeviceInfo`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredDevice {
    pub info: DeviceInfo,
    pub status: DeviceStatus,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Bound transport session, if any.  A new registration under the same
    /// device id supersedes and invalidates the previous binding.
    pub connection_id: Option<ConnectionId>,
    pub paired: bool,
    /// One-time pairing secret; `Some` only while the device is unpaired.
    pub pairing_token: Option<String>,
    pub pairing_expires_at: Option<Instant>,
    /// Opaque secret issued on successful pairing; `Some` iff `paired`.
    pub auth_token: Option<String>,
}

impl RegisteredDevice {
    /// Returns `true` while a live session is bound (connected or paired).
    pub fn is_online(&self) -> bool {
        matches!(self.status, DeviceStatus::Connected | DeviceStatus::Paired)
    }

    /// Returns `true` if this device advertises the given command.
    pub fn supports(&self, command: CommandType) -> bool {
        self.info.supports(command)
    }
}

/// Error type for pairing operations.
///
/// The `Display` text of these variants is sent verbatim in
/// `pairing_response.error`, so it is part of the wire contract.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairError {
    #[error("Device not found")]
    DeviceNotFound,
    /// No outstanding pairing token; covers both already-paired devices and
    /// replay of a consumed token.
    #[error("Device does not support pairing")]
    PairingNotSupported,
    #[error("Invalid pairing token")]
    TokenMismatch,
    #[error("Pairing token expired")]
    TokenExpired,
}

/// Typed notifications emitted on every registry mutation.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    DeviceRegistered { device_id: String },
    DeviceUpdated { device_id: String },
    /// A restarted peer re-registered under a new id; the old record was
    /// migrated rather than duplicated.
    DeviceMigrated { old_id: String, new_id: String },
    DeviceConnected {
        device_id: String,
        connection_id: ConnectionId,
    },
    DeviceDisconnected { device_id: String },
    DevicePaired { device_id: String },
    DeviceUnpaired { device_id: String },
    /// Removed by the staleness sweep.
    DeviceExpired { device_id: String },
}

/// In-memory registry of all known devices.
///
/// The registry is stored behind a `tokio::sync::Mutex` by the control
/// server so the multi-threaded runtime serializes all access; the registry
/// itself is plain synchronous code.
pub struct DeviceRegistry {
    devices: HashMap<String, RegisteredDevice>,
    pairing_ttl: Duration,
    event_tx: mpsc::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Creates a registry and returns it together with the event receiver.
    pub fn new(pairing_ttl: Duration) -> (Self, mpsc::Receiver<RegistryEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let registry = Self {
            devices: HashMap::new(),
            pairing_ttl,
            event_tx: tx,
        };
        (registry, rx)
    }

    fn emit(&self, event: RegistryEvent) {
        // Observers may lag; a full channel drops the notification rather
        // than blocking registry mutation.
        if self.event_tx.try_send(event).is_err() {
            debug!("registry event channel full; notification dropped");
        }
    }

    /// Issues a fresh pairing token when the device is unpaired and holds no
    /// unexpired token.
    fn ensure_pairing_token(device: &mut RegisteredDevice, ttl: Duration, now: Instant) {
        if device.paired {
            return;
        }
        let valid = device.pairing_token.is_some()
            && device.pairing_expires_at.map(|t| now < t).unwrap_or(false);
        if !valid {
            device.pairing_token = Some(generate_token(TOKEN_LEN));
            device.pairing_expires_at = Some(now + ttl);
        }
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Idempotent upsert keyed primarily by device id.
    ///
    /// If the id is unknown but `ip` (or `mac`) matches an existing record,
    /// that record migrates to the new id — a peer restart regenerated its
    /// identity and must not produce a duplicate entry.
    pub fn register_device(&mut self, info: DeviceInfo) -> RegisteredDevice {
        let now = Instant::now();

        if self.devices.contains_key(&info.id) {
            let device = self.devices.get_mut(&info.id).expect("checked above");
            device.info = info.clone();
            device.last_seen = now;
            Self::ensure_pairing_token(device, self.pairing_ttl, now);
            let snapshot = device.clone();
            self.emit(RegistryEvent::DeviceUpdated {
                device_id: info.id,
            });
            return snapshot;
        }

        if let Some(old_id) = self.find_restart_candidate(&info) {
            let mut device = self.devices.remove(&old_id).expect("candidate exists");
            info!(
                old_id = %old_id,
                new_id = %info.id,
                "device re-registered under a new id; migrating record"
            );
            device.info = info.clone();
            device.last_seen = now;
            Self::ensure_pairing_token(&mut device, self.pairing_ttl, now);
            let snapshot = device.clone();
            self.devices.insert(info.id.clone(), device);
            self.emit(RegistryEvent::DeviceMigrated {
                old_id,
                new_id: info.id,
            });
            return snapshot;
        }

        let mut device = RegisteredDevice {
            info: info.clone(),
            status: DeviceStatus::Connecting,
            first_seen: now,
            last_seen: now,
            connection_id: None,
            paired: false,
            pairing_token: None,
            pairing_expires_at: None,
            auth_token: None,
        };
        Self::ensure_pairing_token(&mut device, self.pairing_ttl, now);
        let snapshot = device.clone();
        self.devices.insert(info.id.clone(), device);
        info!(device_id = %info.id, name = %info.name, "new device registered");
        self.emit(RegistryEvent::DeviceRegistered { device_id: info.id });
        snapshot
    }

    /// Returns the id of a record a new identity should migrate into:
    /// same ip, or same mac when both sides advertise one.
    fn find_restart_candidate(&self, info: &DeviceInfo) -> Option<String> {
        self.devices
            .values()
            .find(|d| {
                d.info.ip == info.ip
                    || (d.info.mac.is_some() && d.info.mac == info.mac)
            })
            .map(|d| d.info.id.clone())
    }

    // ── Connectivity ──────────────────────────────────────────────────────────

    /// Binds a live session to a device and marks it connected (or paired,
    /// when the pairing relationship already exists).
    ///
    /// Any other device currently holding this `connection_id` loses the
    /// binding: a connection maps to at most one device.
    pub fn connect_device(
        &mut self,
        device_id: &str,
        connection_id: ConnectionId,
    ) -> Result<RegisteredDevice, PairError> {
        for other in self.devices.values_mut() {
            if other.info.id != device_id && other.connection_id == Some(connection_id) {
                other.connection_id = None;
            }
        }

        let device = self
            .devices
            .get_mut(device_id)
            .ok_or(PairError::DeviceNotFound)?;
        device.connection_id = Some(connection_id);
        device.status = if device.paired {
            DeviceStatus::Paired
        } else {
            DeviceStatus::Connected
        };
        device.last_seen = Instant::now();
        let snapshot = device.clone();
        self.emit(RegistryEvent::DeviceConnected {
            device_id: device_id.to_string(),
            connection_id,
        });
        Ok(snapshot)
    }

    /// Clears the session binding and demotes the device to disconnected.
    ///
    /// Pairing state survives; connectivity does not.
    pub fn disconnect_device(&mut self, device_id: &str) -> Result<RegisteredDevice, PairError> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or(PairError::DeviceNotFound)?;
        device.connection_id = None;
        device.status = DeviceStatus::Disconnected;
        let snapshot = device.clone();
        self.emit(RegistryEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
        });
        Ok(snapshot)
    }

    /// Refreshes `last_seen` for a device (heartbeat-driven).
    pub fn touch(&mut self, device_id: &str) {
        if let Some(device) = self.devices.get_mut(device_id) {
            device.last_seen = Instant::now();
        }
    }

    // ── Pairing ───────────────────────────────────────────────────────────────

    /// Verifies the one-time pairing token and promotes the device to paired.
    ///
    /// # Errors
    ///
    /// [`PairError`] variants distinguish: unknown device, no outstanding
    /// token (covers replay of a consumed token), token mismatch, and token
    /// past its expiration window.
    pub fn pair_device(
        &mut self,
        device_id: &str,
        token: &str,
    ) -> Result<RegisteredDevice, PairError> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or(PairError::DeviceNotFound)?;

        let issued = device
            .pairing_token
            .as_deref()
            .ok_or(PairError::PairingNotSupported)?;
        if issued != token {
            return Err(PairError::TokenMismatch);
        }
        if let Some(expires_at) = device.pairing_expires_at {
            if Instant::now() >= expires_at {
                return Err(PairError::TokenExpired);
            }
        }

        device.auth_token = Some(generate_token(TOKEN_LEN));
        device.paired = true;
        device.pairing_token = None;
        device.pairing_expires_at = None;
        if device.status == DeviceStatus::Connected {
            device.status = DeviceStatus::Paired;
        }
        device.last_seen = Instant::now();
        let snapshot = device.clone();
        info!(device_id, "device paired");
        self.emit(RegistryEvent::DevicePaired {
            device_id: device_id.to_string(),
        });
        Ok(snapshot)
    }

    /// Revokes the pairing: clears the auth token, issues a fresh pairing
    /// token, and demotes paired→connected.
    pub fn unpair_device(&mut self, device_id: &str) -> Result<RegisteredDevice, PairError> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or(PairError::DeviceNotFound)?;

        device.auth_token = None;
        device.paired = false;
        device.pairing_token = Some(generate_token(TOKEN_LEN));
        device.pairing_expires_at = Some(Instant::now() + self.pairing_ttl);
        if device.status == DeviceStatus::Paired {
            device.status = DeviceStatus::Connected;
        }
        let snapshot = device.clone();
        info!(device_id, "device unpaired");
        self.emit(RegistryEvent::DeviceUnpaired {
            device_id: device_id.to_string(),
        });
        Ok(snapshot)
    }

    // ── Lookups and listings ──────────────────────────────────────────────────

    pub fn get(&self, device_id: &str) -> Option<&RegisteredDevice> {
        self.devices.get(device_id)
    }

    pub fn find_by_ip(&self, ip: std::net::IpAddr) -> Option<&RegisteredDevice> {
        self.devices.values().find(|d| d.info.ip == ip)
    }

    pub fn find_by_mac(&self, mac: &str) -> Option<&RegisteredDevice> {
        self.devices
            .values()
            .find(|d| d.info.mac.as_deref() == Some(mac))
    }

    pub fn find_by_connection(&self, connection_id: ConnectionId) -> Option<&RegisteredDevice> {
        self.devices
            .values()
            .find(|d| d.connection_id == Some(connection_id))
    }

    /// Snapshot of every known device.
    pub fn all(&self) -> Vec<RegisteredDevice> {
        self.devices.values().cloned().collect()
    }

    /// Devices with a live session (connected or paired).
    pub fn connected(&self) -> Vec<RegisteredDevice> {
        self.devices
            .values()
            .filter(|d| d.is_online())
            .cloned()
            .collect()
    }

    /// Devices that completed the pairing handshake.
    pub fn paired(&self) -> Vec<RegisteredDevice> {
        self.devices.values().filter(|d| d.paired).cloned().collect()
    }

    // ── Staleness sweep ───────────────────────────────────────────────────────

    /// Removes devices unseen for longer than `max_age` and returns their ids.
    pub fn cleanup_old_devices(&mut self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .devices
            .values()
            .filter(|d| now.duration_since(d.last_seen) > max_age)
            .map(|d| d.info.id.clone())
            .collect();
        for id in &stale {
            self.devices.remove(id);
            info!(device_id = %id, "stale device removed");
            self.emit(RegistryEvent::DeviceExpired {
                device_id: id.clone(),
            });
        }
        stale
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::DeviceType;

    fn device(id: &str, ip: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.to_string(),
            name: format!("target-{id}"),
            ip: ip.parse().unwrap(),
            mac: None,
            device_type: DeviceType::Target,
            supported_commands: vec![CommandType::ArrowLeft, CommandType::ArrowRight],
        }
    }

    fn make_registry() -> (DeviceRegistry, mpsc::Receiver<RegistryEvent>) {
        DeviceRegistry::new(DEFAULT_PAIRING_TTL)
    }

    #[test]
    fn test_register_issues_pairing_token_for_new_device() {
        let (mut registry, _rx) = make_registry();
        let record = registry.register_device(device("t1", "10.0.0.1"));
        assert!(!record.paired);
        assert_eq!(record.pairing_token.as_ref().unwrap().len(), TOKEN_LEN);
        assert!(record.pairing_expires_at.is_some());
        assert!(record.auth_token.is_none());
    }

    #[test]
    fn test_repeated_register_keeps_single_entry_with_monotonic_last_seen() {
        let (mut registry, _rx) = make_registry();
        let first = registry.register_device(device("t1", "10.0.0.1"));
        let second = registry.register_device(device("t1", "10.0.0.1"));
        assert_eq!(registry.all().len(), 1);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(second.first_seen, first.first_seen);
    }

    #[test]
    fn test_register_migrates_record_when_ip_matches_new_id() {
        let (mut registry, _rx) = make_registry();
        registry.register_device(device("old-id", "10.0.0.1"));
        registry.pair_device_unchecked("old-id");

        // Peer restarted and regenerated its identity; same ip.
        let migrated = registry.register_device(device("new-id", "10.0.0.1"));

        assert_eq!(registry.all().len(), 1, "must not duplicate the record");
        assert!(registry.get("old-id").is_none());
        assert!(migrated.paired, "pairing state survives the migration");
    }

    #[test]
    fn test_register_migrates_record_when_mac_matches() {
        let (mut registry, _rx) = make_registry();
        let mut original = device("old-id", "10.0.0.1");
        original.mac = Some("aa:bb:cc:dd:ee:ff".to_string());
        registry.register_device(original);

        let mut restarted = device("new-id", "10.0.0.2");
        restarted.mac = Some("aa:bb:cc:dd:ee:ff".to_string());
        registry.register_device(restarted);

        assert_eq!(registry.all().len(), 1);
        assert!(registry.get("new-id").is_some());
    }

    #[test]
    fn test_pair_with_issued_token_succeeds_and_consumes_token() {
        let (mut registry, _rx) = make_registry();
        let record = registry.register_device(device("t1", "10.0.0.1"));
        let conn = Uuid::new_v4();
        registry.connect_device("t1", conn).unwrap();
        let token = record.pairing_token.unwrap();

        let paired = registry.pair_device("t1", &token).expect("pair");

        assert!(paired.paired);
        assert_eq!(paired.status, DeviceStatus::Paired);
        assert!(paired.auth_token.is_some());
        assert!(paired.pairing_token.is_none());
    }

    #[test]
    fn test_pair_fails_with_mismatch_for_any_other_token() {
        let (mut registry, _rx) = make_registry();
        registry.register_device(device("t1", "10.0.0.1"));
        let result = registry.pair_device("t1", "not-the-token");
        assert_eq!(result, Err(PairError::TokenMismatch));
    }

    #[test]
    fn test_pair_fails_with_expiry_for_correct_token_past_window() {
        // Zero TTL expires the token the moment it is issued.
        let (mut registry, _rx) = DeviceRegistry::new(Duration::ZERO);
        let record = registry.register_device(device("t1", "10.0.0.1"));
        let token = record.pairing_token.unwrap();
        let result = registry.pair_device("t1", &token);
        assert_eq!(result, Err(PairError::TokenExpired));
    }

    #[test]
    fn test_replay_of_consumed_token_reports_pairing_not_supported() {
        let (mut registry, _rx) = make_registry();
        let record = registry.register_device(device("t1", "10.0.0.1"));
        let token = record.pairing_token.unwrap();
        registry.pair_device("t1", &token).expect("first pair");

        // Old token again: the device no longer has an outstanding token,
        // so the failure is "does not support pairing", not a mismatch.
        let result = registry.pair_device("t1", &token);
        assert_eq!(result, Err(PairError::PairingNotSupported));
    }

    #[test]
    fn test_pair_unknown_device_reports_not_found() {
        let (mut registry, _rx) = make_registry();
        assert_eq!(
            registry.pair_device("ghost", "x"),
            Err(PairError::DeviceNotFound)
        );
    }

    #[test]
    fn test_unpair_reissues_pairing_token_and_demotes_status() {
        let (mut registry, _rx) = make_registry();
        let record = registry.register_device(device("t1", "10.0.0.1"));
        registry.connect_device("t1", Uuid::new_v4()).unwrap();
        let token = record.pairing_token.unwrap();
        registry.pair_device("t1", &token).unwrap();

        let unpaired = registry.unpair_device("t1").expect("unpair");

        assert!(!unpaired.paired);
        assert!(unpaired.auth_token.is_none());
        assert_eq!(unpaired.status, DeviceStatus::Connected);
        let new_token = unpaired.pairing_token.expect("fresh token issued");
        assert_ne!(new_token, token);

        // The device is pairable again with the new token.
        assert!(registry.pair_device("t1", &new_token).is_ok());
    }

    #[test]
    fn test_disconnect_resets_status_but_keeps_pairing() {
        let (mut registry, _rx) = make_registry();
        let record = registry.register_device(device("t1", "10.0.0.1"));
        registry.connect_device("t1", Uuid::new_v4()).unwrap();
        let token = record.pairing_token.unwrap();
        registry.pair_device("t1", &token).unwrap();

        let disconnected = registry.disconnect_device("t1").expect("disconnect");

        assert_eq!(disconnected.status, DeviceStatus::Disconnected);
        assert!(disconnected.connection_id.is_none());
        assert!(disconnected.paired, "pairing survives disconnect");
    }

    #[test]
    fn test_reconnect_of_paired_device_restores_paired_status() {
        let (mut registry, _rx) = make_registry();
        let record = registry.register_device(device("t1", "10.0.0.1"));
        registry.connect_device("t1", Uuid::new_v4()).unwrap();
        registry
            .pair_device("t1", &record.pairing_token.unwrap())
            .unwrap();
        registry.disconnect_device("t1").unwrap();

        let reconnected = registry.connect_device("t1", Uuid::new_v4()).unwrap();
        assert_eq!(reconnected.status, DeviceStatus::Paired);
    }

    #[test]
    fn test_connection_id_binds_to_at_most_one_device() {
        let (mut registry, _rx) = make_registry();
        registry.register_device(device("t1", "10.0.0.1"));
        registry.register_device(device("t2", "10.0.0.2"));
        let conn = Uuid::new_v4();

        registry.connect_device("t1", conn).unwrap();
        registry.connect_device("t2", conn).unwrap();

        assert!(registry.get("t1").unwrap().connection_id.is_none());
        assert_eq!(registry.get("t2").unwrap().connection_id, Some(conn));
    }

    #[test]
    fn test_lookups_by_ip_mac_and_connection() {
        let (mut registry, _rx) = make_registry();
        let mut info = device("t1", "10.0.0.7");
        info.mac = Some("aa:bb:cc:00:11:22".to_string());
        registry.register_device(info);
        let conn = Uuid::new_v4();
        registry.connect_device("t1", conn).unwrap();

        assert!(registry.find_by_ip("10.0.0.7".parse().unwrap()).is_some());
        assert!(registry.find_by_mac("aa:bb:cc:00:11:22").is_some());
        assert!(registry.find_by_connection(conn).is_some());
        assert!(registry.find_by_ip("10.0.0.8".parse().unwrap()).is_none());
    }

    #[test]
    fn test_connected_and_paired_listings() {
        let (mut registry, _rx) = make_registry();
        let r1 = registry.register_device(device("t1", "10.0.0.1"));
        registry.register_device(device("t2", "10.0.0.2"));
        registry.connect_device("t1", Uuid::new_v4()).unwrap();
        registry.pair_device("t1", &r1.pairing_token.unwrap()).unwrap();

        assert_eq!(registry.all().len(), 2);
        assert_eq!(registry.connected().len(), 1);
        assert_eq!(registry.paired().len(), 1);
        assert_eq!(registry.paired()[0].info.id, "t1");
    }

    #[test]
    fn test_cleanup_removes_only_stale_devices() {
        let (mut registry, _rx) = make_registry();
        registry.register_device(device("t1", "10.0.0.1"));

        // max_age of zero: everything is already stale except entries touched
        // "now" — duration_since(last_seen) > 0 holds for both on any real
        // clock tick, so use a generous age for the keep case instead.
        let removed = registry.cleanup_old_devices(Duration::from_secs(3600));
        assert!(removed.is_empty());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_registry_emits_events_for_mutations() {
        let (mut registry, mut rx) = make_registry();
        let record = registry.register_device(device("t1", "10.0.0.1"));
        registry.connect_device("t1", Uuid::new_v4()).unwrap();
        registry.pair_device("t1", &record.pairing_token.unwrap()).unwrap();
        registry.disconnect_device("t1").unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], RegistryEvent::DeviceRegistered { .. }));
        assert!(matches!(seen[1], RegistryEvent::DeviceConnected { .. }));
        assert!(matches!(seen[2], RegistryEvent::DevicePaired { .. }));
        assert!(matches!(seen[3], RegistryEvent::DeviceDisconnected { .. }));
    }

    // Test helper: force a device into the paired state without the token
    // round trip.
    impl DeviceRegistry {
        fn pair_device_unchecked(&mut self, device_id: &str) {
            let token = self
                .get(device_id)
                .and_then(|d| d.pairing_token.clone())
                .expect("unpaired device with token");
            self.pair_device(device_id, &token).expect("pair");
        }
    }
}
