//! Beacon registry.
//!
//! Maps stable [`BeaconId`]s to identities, status snapshots and running
//! sessions. Identities are keyed by advertised name: a name seen again is
//! the same beacon, whatever handle the transport gives it this time.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;

use crate::filter::format_distance;
use crate::pairing::PairingIdentifier;
use crate::session::{SessionEventKind, SessionHandle};
use crate::types::{Advertisement, BeaconId, BeaconIdentity, BeaconStatus, PeripheralHandle};

/// Result of registering a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// A new identity was allocated.
    New(BeaconId),
    /// The name was already known.
    Existing(BeaconId),
}

impl Sighting {
    /// The beacon id either way.
    #[must_use]
    pub const fn id(self) -> BeaconId {
        match self {
            Self::New(id) | Self::Existing(id) => id,
        }
    }
}

#[derive(Debug)]
struct BeaconEntry {
    identity: BeaconIdentity,
    status: BeaconStatus,
    session: Option<SessionHandle>,
}

/// Registry of known beacons.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: BTreeMap<BeaconId, BeaconEntry>,
    by_name: HashMap<String, BeaconId>,
    next_id: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sighting, reusing the identity if the name is known.
    ///
    /// The handle is recorded on the identity either way.
    pub fn register_sighting(
        &mut self,
        advertisement: &Advertisement,
        pairing: &PairingIdentifier,
    ) -> Sighting {
        let name = advertisement.display_name();
        if let Some(id) = self.by_name.get(name).copied() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.identity.handle = Some(advertisement.handle.clone());
            }
            return Sighting::Existing(id);
        }

        let id = BeaconId(self.next_id);
        self.next_id += 1;
        let identity = BeaconIdentity {
            id,
            name: name.to_string(),
            pairing: pairing.clone(),
            label: None,
            handle: Some(advertisement.handle.clone()),
        };
        let status = BeaconStatus::new(&identity);
        self.by_name.insert(identity.name.clone(), id);
        self.entries.insert(
            id,
            BeaconEntry {
                identity,
                status,
                session: None,
            },
        );
        Sighting::New(id)
    }

    /// Look up a beacon by advertised name.
    #[must_use]
    pub fn id_by_name(&self, name: &str) -> Option<BeaconId> {
        self.by_name.get(name).copied()
    }

    /// Find the beacon currently bound to a transport handle.
    #[must_use]
    pub fn find_by_handle(&self, handle: &PeripheralHandle) -> Option<BeaconId> {
        self.entries
            .values()
            .find(|entry| entry.identity.handle.as_ref() == Some(handle))
            .map(|entry| entry.identity.id)
    }

    /// Identity of a beacon.
    #[must_use]
    pub fn identity(&self, id: BeaconId) -> Option<&BeaconIdentity> {
        self.entries.get(&id).map(|entry| &entry.identity)
    }

    /// Status of a beacon.
    #[must_use]
    pub fn status(&self, id: BeaconId) -> Option<&BeaconStatus> {
        self.entries.get(&id).map(|entry| &entry.status)
    }

    /// Running session of a beacon.
    #[must_use]
    pub fn session(&self, id: BeaconId) -> Option<&SessionHandle> {
        self.entries.get(&id).and_then(|entry| entry.session.as_ref())
    }

    /// Set or clear the user label. Returns `false` if the beacon is unknown.
    pub fn set_label(&mut self, id: BeaconId, label: Option<String>) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.identity.label.clone_from(&label);
        entry.status.label = label;
        entry.status.updated_at_utc = Utc::now();
        true
    }

    /// Record a new handle for a beacon.
    pub fn set_handle(&mut self, id: BeaconId, handle: PeripheralHandle) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.identity.handle = Some(handle);
        }
    }

    /// Forget the handle of a beacon whose link dropped.
    pub fn clear_handle(&mut self, id: BeaconId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.identity.handle = None;
        }
    }

    /// Attach a running session.
    pub fn attach_session(&mut self, id: BeaconId, session: SessionHandle) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.session = Some(session);
        }
    }

    /// Remove a beacon, returning its session if one was running.
    pub fn remove(&mut self, id: BeaconId) -> Option<Option<SessionHandle>> {
        let entry = self.entries.remove(&id)?;
        self.by_name.remove(&entry.identity.name);
        Some(entry.session)
    }

    /// Remove every beacon, returning ids and sessions.
    pub fn drain(&mut self) -> Vec<(BeaconId, Option<SessionHandle>)> {
        self.by_name.clear();
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(id, entry)| (id, entry.session))
            .collect()
    }

    /// Apply a session event to a beacon's status.
    ///
    /// Returns `false` if the beacon is unknown.
    pub fn apply(&mut self, id: BeaconId, event: &SessionEventKind) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        let status = &mut entry.status;
        match event {
            SessionEventKind::Connection { state, reconnects } => {
                status.connection = *state;
                status.reconnects = *reconnects;
            }
            SessionEventKind::TxPower(tx_power) => status.tx_power = *tx_power,
            SessionEventKind::Battery(level) => {
                status.battery_level = Some(*level);
                status.battery_reported = true;
            }
            SessionEventKind::Distance {
                distance_mm,
                range,
                batches_completed,
                ..
            } => {
                status.distance_mm = Some(*distance_mm);
                status.distance_text = Some(format_distance(*distance_mm));
                status.range = *range;
                status.batches_completed = *batches_completed;
                status.tracking_started = true;
            }
            SessionEventKind::Worn { state, .. } => status.worn = *state,
            SessionEventKind::Tracking(tracking) => status.tracking = *tracking,
            SessionEventKind::ConnectFailed { .. } | SessionEventKind::RescanRequested => {}
        }
        status.updated_at_utc = Utc::now();
        true
    }

    /// Status snapshots in id order.
    #[must_use]
    pub fn statuses(&self) -> Vec<BeaconStatus> {
        self.entries.values().map(|entry| entry.status.clone()).collect()
    }

    /// Whether any beacon has sampling switched on.
    #[must_use]
    pub fn any_tracking(&self) -> bool {
        self.entries.values().any(|entry| entry.status.tracking)
    }

    /// Distinct pairing identifiers of beacons with sampling switched on.
    #[must_use]
    pub fn tracked_pairings(&self) -> Vec<PairingIdentifier> {
        let mut pairings: Vec<PairingIdentifier> = Vec::new();
        for entry in self.entries.values().filter(|entry| entry.status.tracking) {
            if !pairings.contains(&entry.identity.pairing) {
                pairings.push(entry.identity.pairing.clone());
            }
        }
        pairings
    }

    /// Ids in order.
    #[must_use]
    pub fn ids(&self) -> Vec<BeaconId> {
        self.entries.keys().copied().collect()
    }

    /// Number of known beacons.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no beacon is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::RangeEvent;
    use crate::types::{ConnectionState, RangeState};

    fn sighting(handle: &str, name: Option<&str>) -> Advertisement {
        Advertisement {
            handle: PeripheralHandle::new(handle),
            local_name: name.map(str::to_string),
            rssi: Some(-60),
            manufacturer_data: None,
        }
    }

    fn pairing() -> PairingIdentifier {
        PairingIdentifier::new("180A").unwrap()
    }

    #[test]
    fn test_same_name_reuses_identity() {
        let mut registry = ConnectionRegistry::new();
        let first = registry.register_sighting(&sighting("AA", Some("Band-1")), &pairing());
        let again = registry.register_sighting(&sighting("BB", Some("Band-1")), &pairing());

        assert_eq!(first, Sighting::New(BeaconId(0)));
        assert_eq!(again, Sighting::Existing(BeaconId(0)));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.find_by_handle(&PeripheralHandle::new("BB")),
            Some(BeaconId(0))
        );
    }

    #[test]
    fn test_unnamed_beacons_share_unknown_identity() {
        let mut registry = ConnectionRegistry::new();
        registry.register_sighting(&sighting("AA", None), &pairing());
        let second = registry.register_sighting(&sighting("BB", None), &pairing());
        assert_eq!(second, Sighting::Existing(BeaconId(0)));
        assert_eq!(registry.id_by_name("Unknown"), Some(BeaconId(0)));
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut registry = ConnectionRegistry::new();
        registry.register_sighting(&sighting("AA", Some("Band-1")), &pairing());
        assert!(registry.remove(BeaconId(0)).is_some());
        let next = registry.register_sighting(&sighting("AA", Some("Band-1")), &pairing());
        assert_eq!(next, Sighting::New(BeaconId(1)));
    }

    #[test]
    fn test_statuses_track_identities() {
        let mut registry = ConnectionRegistry::new();
        registry.register_sighting(&sighting("AA", Some("Band-1")), &pairing());
        registry.register_sighting(&sighting("BB", Some("Band-2")), &pairing());
        let statuses = registry.statuses();
        assert_eq!(statuses.len(), registry.len());
        assert_eq!(statuses[1].name, "Band-2");
        assert_eq!(statuses[0].pairing_identifier, pairing().to_string());
    }

    #[test]
    fn test_apply_distance_updates_status() {
        let mut registry = ConnectionRegistry::new();
        let id = registry
            .register_sighting(&sighting("AA", Some("Band-1")), &pairing())
            .id();

        assert!(registry.apply(
            id,
            &SessionEventKind::Connection {
                state: ConnectionState::Ready,
                reconnects: 0
            }
        ));
        assert!(registry.apply(
            id,
            &SessionEventKind::Distance {
                distance_mm: 4500.0,
                range: RangeState::OutOfRange,
                transition: Some(RangeEvent::OutOfRangeConfirmed { entered: true }),
                batches_completed: 2,
            }
        ));

        let status = registry.status(id).unwrap();
        assert_eq!(status.connection, ConnectionState::Ready);
        assert_eq!(status.range, RangeState::OutOfRange);
        assert_eq!(status.distance_text.as_deref(), Some("4.5 m"));
        assert!(status.tracking_started);
        assert!(!registry.apply(BeaconId(9), &SessionEventKind::Battery(50)));
    }

    #[test]
    fn test_tracked_pairings_follow_tracking_events() {
        let mut registry = ConnectionRegistry::new();
        let other = PairingIdentifier::new("FEAA").unwrap();
        let a = registry.register_sighting(&sighting("AA", Some("Band-1")), &pairing()).id();
        let b = registry.register_sighting(&sighting("BB", Some("Band-2")), &pairing()).id();
        let c = registry.register_sighting(&sighting("CC", Some("Band-3")), &other).id();
        assert!(!registry.any_tracking());

        registry.apply(a, &SessionEventKind::Tracking(true));
        registry.apply(b, &SessionEventKind::Tracking(true));
        assert!(registry.any_tracking());
        assert_eq!(registry.tracked_pairings(), vec![pairing()]);

        registry.apply(c, &SessionEventKind::Tracking(true));
        registry.apply(a, &SessionEventKind::Tracking(false));
        assert_eq!(registry.tracked_pairings(), vec![pairing(), other]);
    }

    #[test]
    fn test_label_shows_in_status() {
        let mut registry = ConnectionRegistry::new();
        let id = registry
            .register_sighting(&sighting("AA", Some("Band-1")), &pairing())
            .id();
        assert!(registry.set_label(id, Some("Nick".to_string())));
        assert_eq!(registry.identity(id).unwrap().display_name(), "Nick");
        assert_eq!(registry.status(id).unwrap().label.as_deref(), Some("Nick"));
    }
}
