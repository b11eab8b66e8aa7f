/**
 * DEVICE STATE STORE - Représentation autoritative en mémoire de la flotte
 *
 * RÔLE : Fusionner les rapports entrants dans l'état par device sans jamais
 * perdre un champ déjà connu. Lecture = snapshot complet et cohérent.
 *
 * FONCTIONNEMENT : Merge champ par champ pour gpio/sensors (les clés non
 * touchées persistent), remplacement entier pour online. Mutation atomique
 * sous un seul mutex ; publication vers le feed après relâche du lock.
 * Le store ignore tout des commandes : le pipeline relaie les changements.
 */

use crate::feed::{Confidence, StateChange, StateFeed};
use crate::models::{DeviceState, Field, FieldChange, StatePatch};
use crate::state::{new_state, Shared};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

pub struct DeviceStateStore {
    devices: Shared<HashMap<String, DeviceState>>,
    feed: Arc<StateFeed>,
}

impl DeviceStateStore {
    pub fn new(feed: Arc<StateFeed>) -> Self {
        Self {
            devices: new_state(HashMap::new()),
            feed,
        }
    }

    /// Snapshot du device, ou None s'il n'a jamais été observé.
    /// Jamais d'état par défaut inventé.
    pub fn get(&self, device_id: &str) -> Option<DeviceState> {
        self.devices.lock().get(device_id).cloned()
    }

    /// Fusionne un patch dans l'état du device (créé au besoin) et retourne
    /// les champs appliqués, déjà publiés comme autoritatifs sur le feed.
    pub fn upsert(&self, device_id: &str, patch: StatePatch, now: OffsetDateTime) -> Vec<FieldChange> {
        let changes = {
            let mut devices = self.devices.lock();
            let device = devices
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceState::new(device_id, now));
            device.last_seen = now;

            let mut changes = Vec::new();
            for (pin, level) in patch.gpio {
                device.gpio.insert(pin, level);
                changes.push(FieldChange { field: Field::Gpio(pin), value: json!(level) });
            }
            for (key, value) in patch.sensors {
                device.sensors.insert(key.clone(), value.clone());
                changes.push(FieldChange { field: Field::Sensor(key), value });
            }
            if let Some(online) = patch.online {
                device.online = online;
                changes.push(FieldChange { field: Field::Online, value: json!(online) });
            }
            changes
        };

        for change in &changes {
            self.feed.publish(StateChange::Updated {
                device_id: device_id.to_string(),
                field: change.field.clone(),
                value: change.value.clone(),
                confidence: Confidence::Authoritative,
            });
        }
        changes
    }

    /// Bascule explicite de liveness, réservée au presence tracker.
    pub fn set_online(&self, device_id: &str, online: bool) {
        {
            let mut devices = self.devices.lock();
            let device = devices
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceState::new(device_id, OffsetDateTime::now_utc()));
            device.online = online;
        }
        self.feed.publish(StateChange::Updated {
            device_id: device_id.to_string(),
            field: Field::Online,
            value: json!(online),
            confidence: Confidence::Authoritative,
        });
    }

    /// Met à jour last_seen sans publier (chaque message en produit un).
    pub fn touch(&self, device_id: &str, now: OffsetDateTime) {
        let mut devices = self.devices.lock();
        let device = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceState::new(device_id, now));
        device.last_seen = now;
    }

    /// Insertion silencieuse au démarrage depuis le snapshot durable.
    pub fn seed_device(&self, device_id: &str, online: bool, last_seen: OffsetDateTime) {
        let mut devices = self.devices.lock();
        let device = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceState::new(device_id, last_seen));
        device.online = online;
        device.last_seen = last_seen;
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::StateFeed;
    use serde_json::json;

    fn store() -> (DeviceStateStore, Arc<StateFeed>) {
        let feed = Arc::new(StateFeed::new());
        (DeviceStateStore::new(feed.clone()), feed)
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn test_unknown_device_is_none() {
        let (store, _feed) = store();
        assert!(store.get("never-seen").is_none());
    }

    #[test]
    fn test_merge_keeps_untouched_keys() {
        let (store, _feed) = store();
        store.upsert("pump-1", StatePatch::gpio(4, 1), now());
        store.upsert("pump-1", StatePatch::gpio(2, 0), now());
        store.upsert("pump-1", StatePatch::sensor("tempC", json!(25.3)), now());
        // écrasement d'une clé existante
        store.upsert("pump-1", StatePatch::gpio(4, 0), now());

        let state = store.get("pump-1").unwrap();
        assert_eq!(state.gpio.get(&4), Some(&0));
        assert_eq!(state.gpio.get(&2), Some(&0));
        assert_eq!(state.sensors.get("tempC"), Some(&json!(25.3)));
    }

    #[test]
    fn test_upsert_publishes_authoritative_changes() {
        let (store, feed) = store();
        let (_id, mut rx) = feed.subscribe();
        let changes = store.upsert("pump-1", StatePatch::gpio(4, 1), now());

        assert_eq!(changes.len(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            StateChange::Updated {
                device_id: "pump-1".into(),
                field: Field::Gpio(4),
                value: json!(1),
                confidence: Confidence::Authoritative,
            }
        );
    }

    #[test]
    fn test_set_online_overrides_flag() {
        let (store, feed) = store();
        let (_id, mut rx) = feed.subscribe();
        store.upsert("pump-1", StatePatch::gpio(4, 1), now());
        let _ = rx.try_recv();

        store.set_online("pump-1", true);
        assert!(store.get("pump-1").unwrap().online);
        assert_eq!(
            rx.try_recv().unwrap(),
            StateChange::Updated {
                device_id: "pump-1".into(),
                field: Field::Online,
                value: json!(true),
                confidence: Confidence::Authoritative,
            }
        );

        store.set_online("pump-1", false);
        assert!(!store.get("pump-1").unwrap().online);
    }

    #[test]
    fn test_touch_updates_last_seen_silently() {
        let (store, feed) = store();
        let (_id, mut rx) = feed.subscribe();
        let t = now();
        store.touch("pump-1", t);
        assert_eq!(store.get("pump-1").unwrap().last_seen, t);
        assert!(rx.try_recv().is_err());
    }
}
