use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyncConfig {
    /// Préfixe de namespace des topics (`saphari/{deviceId}/{channel}`).
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Fenêtre de liveness : un device sans activité depuis plus de TTL passe offline.
    #[serde(default = "default_presence_ttl_ms")]
    pub presence_ttl_ms: u64,
    /// Intervalle du sweep, volontairement plus court que le TTL pour borner
    /// la latence de détection à un cycle.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub default_command_timeout_ms: u64,
    /// Devices visibles par cette session (second contrôle après le filtrage du broker).
    #[serde(default)]
    pub authorized_devices: Vec<String>,
    #[serde(default = "default_data_file")]
    pub data_file: String,
    pub mqtt: Option<MqttConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

fn default_namespace() -> String {
    "saphari".into()
}
fn default_presence_ttl_ms() -> u64 {
    45_000
}
fn default_sweep_interval_ms() -> u64 {
    10_000
}
fn default_command_timeout_ms() -> u64 {
    5_000
}
fn default_data_file() -> String {
    "./data/devices.json".into()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            presence_ttl_ms: default_presence_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            default_command_timeout_ms: default_command_timeout_ms(),
            authorized_devices: Vec::new(),
            data_file: default_data_file(),
            mqtt: Some(MqttConf { host: "localhost".into(), port: 1883 }),
        }
    }
}

pub async fn load_config() -> SyncConfig {
    let path = std::env::var("SAPHARI_SYNC_CONFIG").unwrap_or_else(|_| "sync.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return SyncConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            eprintln!("[sync] config invalide: {e}");
            SyncConfig::default()
        })
    } else {
        eprintln!("[sync] pas de sync.yaml, usage config par défaut");
        SyncConfig::default()
    }
}
