use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use time::OffsetDateTime;

/// État courant d'un device tel que rapporté par lui-même.
/// Créé à la première observation, jamais détruit, muté uniquement via le store.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceState {
    pub device_id: String,
    pub online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub gpio: HashMap<u8, u8>,
    pub sensors: HashMap<String, Value>,
}

impl DeviceState {
    pub fn new(device_id: &str, now: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.to_string(),
            online: false,
            last_seen: now,
            gpio: HashMap::new(),
            sensors: HashMap::new(),
        }
    }
}

/// Mise à jour partielle fusionnée champ par champ dans un DeviceState.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub gpio: HashMap<u8, u8>,
    pub sensors: HashMap<String, Value>,
    pub online: Option<bool>,
}

impl StatePatch {
    pub fn gpio(pin: u8, level: u8) -> Self {
        let mut patch = Self::default();
        patch.gpio.insert(pin, level);
        patch
    }

    pub fn sensor(key: impl Into<String>, value: Value) -> Self {
        let mut patch = Self::default();
        patch.sensors.insert(key.into(), value);
        patch
    }
}

/// Champ adressable d'un device dans le flux d'état publié.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "key")]
pub enum Field {
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "gpio")]
    Gpio(u8),
    #[serde(rename = "sensor")]
    Sensor(String),
}

/// Un champ effectivement appliqué par un upsert, retourné au pipeline
/// pour que le reconciler voie passer les valeurs autoritatives.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: Field,
    pub value: Value,
}

/// Snapshot de liveness rechargé depuis le stockage durable au démarrage.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub online: bool,
    pub last_seen: OffsetDateTime,
}

/// Transition de liveness poussée vers le writer de persistance (fire-and-forget).
#[derive(Debug, Clone)]
pub struct LivenessTransition {
    pub device_id: String,
    pub online: bool,
    pub at: OffsetDateTime,
}

/// Commande sortante remise au transport externe.
/// Le payload suit le format `cmd` du firmware : type, reqId, pin, value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub device_id: String,
    pub payload: Value,
}
