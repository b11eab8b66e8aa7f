/**
 * TOPIC ROUTER - Parsing des messages bruts en événements typés
 *
 * RÔLE : Convertir une paire (topic, payload) du bus partagé en un variant
 * fermé de RoutedEvent, selon le schéma `namespace/deviceId/channel[/...]`.
 *
 * FONCTIONNEMENT : Aucun état. Tout ce qui ne matche pas est droppé en
 * silence : le bus transporte du trafic étranger et des payloads corrompus
 * par design. Les devices hors du set autorisé disparaissent sans trace
 * (frontière de sécurité, pas un chemin de bug).
 */

use crate::models::StatePatch;
use serde_json::Value;
use std::collections::HashSet;

/// Ensemble fermé des canaux reconnus, décodé une seule fois ici ;
/// l'aval pattern-matche au lieu de re-parser des strings.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedEvent {
    /// Signal explicite online/offline (ex: last-will du broker).
    PresenceSignal { device_id: String, online: bool },
    /// Niveau rapporté d'une pin GPIO (0 ou 1).
    GpioReport { device_id: String, pin: u8, level: u8 },
    /// Snapshot ou lecture capteur, déjà éclaté en patch fusionnable.
    SensorReport { device_id: String, patch: StatePatch },
    /// Activité pure, sans sémantique de payload.
    Heartbeat { device_id: String },
    /// Canal inconnu à clé composée : rapporté tel quel pour extensibilité.
    GenericReport { device_id: String, key: String, raw: String },
}

pub struct TopicRouter {
    namespace: String,
}

impl TopicRouter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into() }
    }

    /// Route un message entrant. `None` = droppé en silence.
    pub fn route(
        &self,
        topic: &str,
        payload: &str,
        authorized: &HashSet<String>,
    ) -> Option<RoutedEvent> {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() < 3 {
            return None;
        }
        if segments[0] != self.namespace {
            return None;
        }
        let device_id = segments[1];
        if device_id.is_empty() || !authorized.contains(device_id) {
            return None;
        }
        let device_id = device_id.to_string();

        match segments[2] {
            "status" if segments.len() >= 4 && segments[3] == "online" => {
                Some(RoutedEvent::PresenceSignal {
                    device_id,
                    online: payload.trim() == "online",
                })
            }
            "gpio" if segments.len() >= 4 => {
                let pin = segments[3].parse::<u8>().ok()?;
                let level = payload.trim().parse::<u8>().ok()?;
                if level > 1 {
                    return None;
                }
                Some(RoutedEvent::GpioReport { device_id, pin, level })
            }
            "state" | "sensor" => {
                if segments.len() >= 4 {
                    // lecture adressée : la valeur atterrit sous la clé du sous-chemin
                    match serde_json::from_str::<Value>(payload) {
                        Ok(value) => Some(RoutedEvent::SensorReport {
                            device_id,
                            patch: StatePatch::sensor(segments[3..].join("/"), value),
                        }),
                        // payload non structuré volontaire : activité seulement
                        Err(_) => Some(RoutedEvent::Heartbeat { device_id }),
                    }
                } else {
                    match serde_json::from_str::<Value>(payload) {
                        Ok(Value::Object(map)) => Some(RoutedEvent::SensorReport {
                            device_id,
                            patch: split_snapshot(map),
                        }),
                        _ => Some(RoutedEvent::Heartbeat { device_id }),
                    }
                }
            }
            "heartbeat" => Some(RoutedEvent::Heartbeat { device_id }),
            _ if segments.len() >= 4 => Some(RoutedEvent::GenericReport {
                device_id,
                key: segments[2..].join("/"),
                raw: payload.to_string(),
            }),
            _ => None,
        }
    }
}

/// Éclate un snapshot complet du firmware en patch : l'objet `gpio` part
/// dans la map gpio (entrées invalides ignorées), l'objet `sensors` est
/// aplati clé par clé, le reste est stocké entier sous sa clé top-level.
fn split_snapshot(map: serde_json::Map<String, Value>) -> StatePatch {
    let mut patch = StatePatch::default();
    for (key, value) in map {
        match key.as_str() {
            "gpio" => {
                if let Value::Object(pins) = value {
                    for (pin, level) in pins {
                        let Ok(pin) = pin.parse::<u8>() else { continue };
                        let Some(level) = level.as_u64().filter(|l| *l <= 1) else { continue };
                        patch.gpio.insert(pin, level as u8);
                    }
                }
            }
            "sensors" => {
                if let Value::Object(readings) = value {
                    for (name, reading) in readings {
                        patch.sensors.insert(name, reading);
                    }
                }
            }
            // métadonnées du snapshot, pas des valeurs capteur
            "deviceId" | "timestamp" => {}
            _ => {
                patch.sensors.insert(key, value);
            }
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn authorized(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn router() -> TopicRouter {
        TopicRouter::new("saphari")
    }

    #[test]
    fn test_foreign_namespace_dropped() {
        let auth = authorized(&["pump-1"]);
        assert_eq!(router().route("devices/pump-1/gpio/4", "1", &auth), None);
        assert_eq!(router().route("junk", "1", &auth), None);
    }

    #[test]
    fn test_unauthorized_device_dropped_silently() {
        let auth = authorized(&["pump-1"]);
        assert_eq!(router().route("saphari/intruder/gpio/4", "1", &auth), None);
        assert_eq!(
            router().route("saphari/intruder/status/online", "online", &auth),
            None
        );
    }

    #[test]
    fn test_status_online_offline() {
        let auth = authorized(&["pump-1"]);
        assert_eq!(
            router().route("saphari/pump-1/status/online", "online", &auth),
            Some(RoutedEvent::PresenceSignal { device_id: "pump-1".into(), online: true })
        );
        // tout autre payload vaut offline (last-will "offline" inclus)
        assert_eq!(
            router().route("saphari/pump-1/status/online", "offline", &auth),
            Some(RoutedEvent::PresenceSignal { device_id: "pump-1".into(), online: false })
        );
    }

    #[test]
    fn test_gpio_report() {
        let auth = authorized(&["pump-1"]);
        assert_eq!(
            router().route("saphari/pump-1/gpio/4", "1", &auth),
            Some(RoutedEvent::GpioReport { device_id: "pump-1".into(), pin: 4, level: 1 })
        );
        assert_eq!(
            router().route("saphari/pump-1/gpio/4", "0", &auth),
            Some(RoutedEvent::GpioReport { device_id: "pump-1".into(), pin: 4, level: 0 })
        );
    }

    #[test]
    fn test_malformed_gpio_dropped() {
        let auth = authorized(&["pump-1"]);
        // hors plage, non numérique, pin non numérique : drop sans activité
        assert_eq!(router().route("saphari/pump-1/gpio/4", "2", &auth), None);
        assert_eq!(router().route("saphari/pump-1/gpio/4", "on", &auth), None);
        assert_eq!(router().route("saphari/pump-1/gpio/led", "1", &auth), None);
        assert_eq!(router().route("saphari/pump-1/gpio", "1", &auth), None);
    }

    #[test]
    fn test_state_snapshot_split() {
        let auth = authorized(&["pump-1"]);
        let payload = r#"{"deviceId":"pump-1","timestamp":123,"gpio":{"4":1,"2":0,"bad":1,"7":9},"sensors":{"tempC":25.3},"gauges":{"battery":92}}"#;
        let event = router().route("saphari/pump-1/state", payload, &auth).unwrap();
        let RoutedEvent::SensorReport { device_id, patch } = event else {
            panic!("expected SensorReport");
        };
        assert_eq!(device_id, "pump-1");
        assert_eq!(patch.gpio.get(&4), Some(&1));
        assert_eq!(patch.gpio.get(&2), Some(&0));
        // pin non numérique et niveau hors plage ignorés
        assert_eq!(patch.gpio.len(), 2);
        assert_eq!(patch.sensors.get("tempC"), Some(&json!(25.3)));
        assert_eq!(patch.sensors.get("gauges"), Some(&json!({"battery": 92})));
        assert!(!patch.sensors.contains_key("deviceId"));
    }

    #[test]
    fn test_sensor_subpath_keyed() {
        let auth = authorized(&["pump-1"]);
        let event = router().route("saphari/pump-1/sensor/tempC", "25.3", &auth).unwrap();
        assert_eq!(
            event,
            RoutedEvent::SensorReport {
                device_id: "pump-1".into(),
                patch: StatePatch::sensor("tempC", json!(25.3)),
            }
        );
    }

    #[test]
    fn test_unparseable_sensor_counts_as_activity() {
        let auth = authorized(&["pump-1"]);
        assert_eq!(
            router().route("saphari/pump-1/state", "not json {", &auth),
            Some(RoutedEvent::Heartbeat { device_id: "pump-1".into() })
        );
    }

    #[test]
    fn test_heartbeat() {
        let auth = authorized(&["pump-1"]);
        assert_eq!(
            router().route("saphari/pump-1/heartbeat", "", &auth),
            Some(RoutedEvent::Heartbeat { device_id: "pump-1".into() })
        );
    }

    #[test]
    fn test_generic_report_needs_compound_key() {
        let auth = authorized(&["pump-1"]);
        assert_eq!(
            router().route("saphari/pump-1/servo/valve", "90", &auth),
            Some(RoutedEvent::GenericReport {
                device_id: "pump-1".into(),
                key: "servo/valve".into(),
                raw: "90".into(),
            })
        );
        // canal inconnu sans quatrième segment : drop
        assert_eq!(router().route("saphari/pump-1/ack", "{}", &auth), None);
    }
}
