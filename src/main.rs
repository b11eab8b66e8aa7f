/**
 * SAPHARI SYNC - Moteur de synchronisation d'état de la flotte IoT
 *
 * RÔLE : Orchestration du pipeline complet : config, persistance, presence,
 * store, reconciler, transport MQTT. Le moteur tourne en continu et sert
 * la dernière vue connue même quand des updates individuels sont droppés.
 *
 * ARCHITECTURE : Flux entrant séquentiel par message + sweep de présence
 * périodique + writer de persistance en tâches indépendantes.
 */

mod config;
mod engine;
mod feed;
mod models;
mod mqtt;
mod persist;
mod presence;
mod reconciler;
mod router;
mod state;
mod store;

use crate::engine::SyncEngine;
use crate::feed::{StateChange, StateFeed};
use crate::persist::FileLivenessStore;
use crate::presence::PresenceTracker;
use crate::reconciler::CommandReconciler;
use crate::router::TopicRouter;
use crate::store::DeviceStateStore;

use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let cfg = config::load_config().await;
    println!(
        "[sync] namespace={} ttl={}ms sweep={}ms authorized={} devices",
        cfg.namespace,
        cfg.presence_ttl_ms,
        cfg.sweep_interval_ms,
        cfg.authorized_devices.len()
    );

    // feed UI + store autoritatif
    let feed = Arc::new(StateFeed::new());
    let store = Arc::new(DeviceStateStore::new(feed.clone()));

    // persistance durable : snapshot au boot, write-through ensuite
    let liveness_file = Arc::new(FileLivenessStore::load(&cfg.data_file));
    let snapshot = liveness_file.snapshot();
    let (persist_tx, persist_rx) = mpsc::unbounded_channel();
    persist::spawn_liveness_writer(persist_rx, liveness_file);

    // presence tracker seedé depuis le snapshot (corrige les flags rances)
    let presence = Arc::new(PresenceTracker::new(
        store.clone(),
        persist_tx,
        cfg.presence_ttl_ms,
    ));
    presence.seed(&snapshot, OffsetDateTime::now_utc());

    // reconciler de commandes optimistes
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let reconciler = Arc::new(CommandReconciler::new(
        store.clone(),
        presence.clone(),
        feed.clone(),
        outbound_tx,
        cfg.default_command_timeout_ms,
    ));

    let engine = Arc::new(SyncEngine::new(
        TopicRouter::new(&cfg.namespace),
        cfg.authorized_devices.iter().cloned().collect(),
        presence.clone(),
        store.clone(),
        reconciler,
    ));

    // transport MQTT : écoute entrante + publication des commandes
    let (client, eventloop) = mqtt::create_mqtt_client(&cfg);
    mqtt::spawn_mqtt_listener(client.clone(), eventloop, engine.clone(), cfg.namespace.clone());
    mqtt::spawn_command_publisher(client, outbound_rx, cfg.namespace.clone());

    // sweep périodique, indépendant de l'arrivée des messages
    PresenceTracker::spawn_sweep(presence, cfg.sweep_interval_ms);

    // consommateur du feed : trace la vue publiée (la couche UI branche ici)
    let (_subscription, mut changes) = feed.subscribe();
    println!("[sync] engine running, tracking {} devices", store.device_count());
    while let Some(change) = changes.recv().await {
        match change {
            StateChange::Updated { device_id, field, value, confidence } => {
                println!("[feed] {device_id} {field:?} = {value} ({confidence:?})");
            }
            StateChange::RolledBack { device_id, field, value } => {
                println!("[feed] {device_id} {field:?} rolled back to {value}");
            }
        }
    }
}
