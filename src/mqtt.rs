use crate::config::{MqttConf, SyncConfig};
use crate::engine::SyncEngine;
use crate::models::OutboundCommand;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, QoS};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task;

pub fn create_mqtt_client(cfg: &SyncConfig) -> (AsyncClient, EventLoop) {
    let mqtt_cfg = cfg
        .mqtt
        .clone()
        .unwrap_or_else(|| MqttConf { host: "localhost".into(), port: 1883 });
    let mut opts = MqttOptions::new("saphari-sync", &mqtt_cfg.host, mqtt_cfg.port);
    opts.set_keep_alive(std::time::Duration::from_secs(15));
    AsyncClient::new(opts, 64)
}

/// Boucle d'écoute : tout le namespace passe par le moteur, qui droppe
/// lui-même le trafic étranger ou non autorisé.
pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    engine: Arc<SyncEngine>,
    namespace: String,
) {
    task::spawn(async move {
        let filter = format!("{namespace}/#");
        if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
            eprintln!("[mqtt] subscribe {filter} failed: {e:?}");
            return;
        }
        println!("[mqtt] subscribed to {filter}");

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(rumqttc::Incoming::Publish(p))) => {
                    // payload non-UTF8 : bruit du bus, on ignore
                    if let Ok(payload) = String::from_utf8(p.payload.to_vec()) {
                        engine.handle_message(&p.topic, &payload);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("[mqtt] connection error: {e:?}");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Draine les commandes sortantes du reconciler vers `{ns}/{device}/cmd`.
/// Fire-and-forget : un échec de publish est loggé, le timeout de la
/// commande fera le ménage côté UI.
pub fn spawn_command_publisher(
    client: AsyncClient,
    mut rx: mpsc::UnboundedReceiver<OutboundCommand>,
    namespace: String,
) {
    task::spawn(async move {
        while let Some(command) = rx.recv().await {
            let topic = format!("{namespace}/{}/cmd", command.device_id);
            match serde_json::to_string(&command.payload) {
                Ok(body) => {
                    if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, body).await {
                        eprintln!("[mqtt] failed to publish command to {topic}: {e:?}");
                    }
                }
                Err(e) => {
                    eprintln!("[mqtt] failed to encode command for {}: {e}", command.device_id)
                }
            }
        }
        println!("[mqtt] command publisher stopped");
    });
}
