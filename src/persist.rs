/**
 * PERSIST - Write-through des transitions de liveness vers le stockage durable
 *
 * RÔLE : Garder un fichier JSON des derniers (online, last_seen) par device,
 * rechargé au démarrage pour seeder le tracker. Best-effort : un échec
 * d'écriture est loggé, l'état mémoire reste autoritatif.
 */

use crate::models::{DeviceSnapshot, LivenessTransition};
use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredLiveness {
    pub online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Hook de persistance : le moteur pousse des transitions, l'implémentation
/// décide du support. Les échecs ne sont jamais fatals pour le moteur.
pub trait LivenessSink: Send + Sync {
    fn record_transition(&self, device_id: &str, online: bool, at: OffsetDateTime) -> Result<()>;
}

pub struct FileLivenessStore {
    path: PathBuf,
    records: Mutex<HashMap<String, StoredLiveness>>,
}

impl FileLivenessStore {
    /// Charge le fichier existant, ou démarre à vide (fichier absent ou
    /// corrompu : on log et on repart, jamais d'échec au boot).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, StoredLiveness>>(&content) {
                Ok(records) => {
                    println!("[persist] loaded {} device records from {}", records.len(), path.display());
                    records
                }
                Err(e) => {
                    eprintln!("[persist] invalid device file {}: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => {
                println!("[persist] no existing device file, starting fresh");
                HashMap::new()
            }
        };
        Self { path, records: Mutex::new(records) }
    }

    /// Snapshot pour seeder le presence tracker au démarrage.
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.records
            .lock()
            .iter()
            .map(|(device_id, stored)| DeviceSnapshot {
                device_id: device_id.clone(),
                online: stored.online,
                last_seen: stored.last_seen,
            })
            .collect()
    }

    fn flush(&self, records: &HashMap<String, StoredLiveness>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(records)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl LivenessSink for FileLivenessStore {
    fn record_transition(&self, device_id: &str, online: bool, at: OffsetDateTime) -> Result<()> {
        let records = {
            let mut records = self.records.lock();
            records.insert(device_id.to_string(), StoredLiveness { online, last_seen: at });
            records.clone()
        };
        self.flush(&records)
    }
}

/// Draine le channel de transitions vers le sink, en dehors de toute
/// section critique du moteur.
pub fn spawn_liveness_writer(
    mut rx: mpsc::UnboundedReceiver<LivenessTransition>,
    sink: Arc<dyn LivenessSink>,
) {
    tokio::spawn(async move {
        while let Some(transition) = rx.recv().await {
            if let Err(e) = sink.record_transition(&transition.device_id, transition.online, transition.at)
            {
                eprintln!(
                    "[persist] failed to record liveness transition for {}: {e}",
                    transition.device_id
                );
            }
        }
        println!("[persist] liveness writer stopped");
    });
}
