/**
 * SYNC ENGINE - Pipeline message brut → vue d'état publiée
 *
 * RÔLE : Composer router, presence, store et reconciler en un flux unique :
 * chaque message entrant est traité séquentiellement, seul le sweep de
 * présence tourne en tâche indépendante.
 *
 * ARCHITECTURE : Instances construites explicitement, aucun état global.
 * Plusieurs moteurs isolés peuvent coexister (tests, multi-sessions).
 */

use crate::models::{DeviceState, FieldChange, StatePatch};
use crate::presence::PresenceTracker;
use crate::reconciler::{CommandError, CommandReconciler, CommandTarget};
use crate::router::{RoutedEvent, TopicRouter};
use crate::state::{new_state, Shared};
use crate::store::DeviceStateStore;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

pub struct SyncEngine {
    router: TopicRouter,
    authorized: Shared<HashSet<String>>,
    presence: Arc<PresenceTracker>,
    store: Arc<DeviceStateStore>,
    reconciler: Arc<CommandReconciler>,
}

impl SyncEngine {
    pub fn new(
        router: TopicRouter,
        authorized: HashSet<String>,
        presence: Arc<PresenceTracker>,
        store: Arc<DeviceStateStore>,
        reconciler: Arc<CommandReconciler>,
    ) -> Self {
        Self {
            router,
            authorized: new_state(authorized),
            presence,
            store,
            reconciler,
        }
    }

    /// Point d'entrée du flux entrant. Un message non routable ne laisse
    /// aucune trace ; un message routé met à jour présence, état, et
    /// relaie les valeurs gpio autoritatives au reconciler.
    pub fn handle_message(&self, topic: &str, payload: &str) {
        let event = {
            let authorized = self.authorized.lock();
            self.router.route(topic, payload, &authorized)
        };
        let Some(event) = event else { return };
        let now = OffsetDateTime::now_utc();

        match event {
            RoutedEvent::PresenceSignal { device_id, online } => {
                self.presence.record_explicit_status(&device_id, online, now);
            }
            RoutedEvent::GpioReport { device_id, pin, level } => {
                self.presence.record_activity(&device_id, now);
                let changes = self.store.upsert(&device_id, StatePatch::gpio(pin, level), now);
                self.forward_gpio(&device_id, &changes);
            }
            RoutedEvent::SensorReport { device_id, patch } => {
                self.presence.record_activity(&device_id, now);
                let changes = self.store.upsert(&device_id, patch, now);
                self.forward_gpio(&device_id, &changes);
            }
            RoutedEvent::Heartbeat { device_id } => {
                self.presence.record_activity(&device_id, now);
            }
            RoutedEvent::GenericReport { device_id, key, raw } => {
                self.presence.record_activity(&device_id, now);
                self.store
                    .upsert(&device_id, StatePatch::sensor(key, Value::String(raw)), now);
            }
        }
    }

    fn forward_gpio(&self, device_id: &str, changes: &[FieldChange]) {
        for change in changes {
            if let crate::models::Field::Gpio(pin) = change.field {
                self.reconciler
                    .on_authoritative_report(device_id, &CommandTarget::Gpio(pin), &change.value);
            }
        }
    }

    /// Commande GPIO côté UI : feedback optimiste immédiat, confirmation ou
    /// rollback ensuite. L'appelant vérifie la liveness via le rejet.
    pub fn issue_gpio(
        &self,
        device_id: &str,
        pin: u8,
        level: u8,
        timeout_ms: Option<u64>,
    ) -> Result<Uuid, CommandError> {
        self.reconciler
            .issue(device_id, CommandTarget::Gpio(pin), json!(level), timeout_ms)
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceState> {
        self.store.get(device_id)
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        self.presence.is_online(device_id)
    }

    pub fn authorize_device(&self, device_id: &str) {
        self.authorized.lock().insert(device_id.to_string());
    }

    pub fn revoke_device(&self, device_id: &str) {
        self.authorized.lock().remove(device_id);
    }
}
