//! The failover authority: the outbound side of the engine.
//!
//! The engine hands movements and drop notifications to the authority and
//! never waits on it. Implementations must return quickly; anything slow
//! belongs on a channel behind the trait.

use parking_lot::Mutex;

use plb_core::{DecisionId, DroppedMovement, FailoverUnitMovementTable};

pub trait FailoverAuthority: Send + Sync {
    /// Movements emitted by one refresh or client API call.
    fn process_movements(&self, movements: &FailoverUnitMovementTable, decision_id: DecisionId);

    /// Candidate movements that were computed but not emitted.
    fn on_movements_dropped(&self, dropped: &[DroppedMovement]);

    /// The auto-scaler changed the instance count of a stateless service.
    fn update_target_replica_count(&self, _service: &str, _target: u32) {}

    /// Every node hosting the application's governed packages has room for
    /// the upgraded governance; the upgrade may proceed.
    fn update_app_upgrade_safety_check(&self, _application: &str) {}
}

/// Records every callback. Used by tests and by embedders that poll
/// instead of reacting.
#[derive(Default)]
pub struct RecordingAuthority {
    movements: Mutex<Vec<(DecisionId, FailoverUnitMovementTable)>>,
    dropped: Mutex<Vec<DroppedMovement>>,
    replica_counts: Mutex<Vec<(String, u32)>>,
    safety_checks: Mutex<Vec<String>>,
}

impl RecordingAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every emitted batch, oldest first.
    pub fn batches(&self) -> Vec<(DecisionId, FailoverUnitMovementTable)> {
        self.movements.lock().clone()
    }

    /// All emitted movements flattened into one list.
    pub fn movements(&self) -> Vec<plb_core::FailoverUnitMovement> {
        self.movements
            .lock()
            .iter()
            .flat_map(|(_, table)| table.values().cloned())
            .collect()
    }

    pub fn dropped(&self) -> Vec<DroppedMovement> {
        self.dropped.lock().clone()
    }

    pub fn replica_count_updates(&self) -> Vec<(String, u32)> {
        self.replica_counts.lock().clone()
    }

    pub fn safety_checks(&self) -> Vec<String> {
        self.safety_checks.lock().clone()
    }

    pub fn clear(&self) {
        self.movements.lock().clear();
        self.dropped.lock().clear();
        self.replica_counts.lock().clear();
        self.safety_checks.lock().clear();
    }
}

impl FailoverAuthority for RecordingAuthority {
    fn process_movements(&self, movements: &FailoverUnitMovementTable, decision_id: DecisionId) {
        self.movements.lock().push((decision_id, movements.clone()));
    }

    fn on_movements_dropped(&self, dropped: &[DroppedMovement]) {
        self.dropped.lock().extend_from_slice(dropped);
    }

    fn update_target_replica_count(&self, service: &str, target: u32) {
        self.replica_counts.lock().push((service.to_string(), target));
    }

    fn update_app_upgrade_safety_check(&self, application: &str) {
        self.safety_checks.lock().push(application.to_string());
    }
}
