/**
 * COMMAND RECONCILER - Feedback optimiste avec rollback ("ghost toggles")
 *
 * RÔLE : Montrer immédiatement la valeur demandée à l'UI, puis la
 * réconcilier contre ce que le device rapporte vraiment. Le rapport
 * autoritatif gagne toujours, l'intention de l'UI jamais.
 *
 * FONCTIONNEMENT : Au plus une commande pendante par (device, cible).
 * En émettre une nouvelle remplace-et-annule l'ancienne atomiquement sous
 * le lock : le timer remplacé ne peut plus déclencher son rollback
 * (AbortHandle + re-vérification du request_id sous le lock à l'expiry).
 */

use crate::feed::{Confidence, StateChange, StateFeed};
use crate::models::{Field, OutboundCommand};
use crate::presence::PresenceTracker;
use crate::state::{new_state, Shared};
use crate::store::DeviceStateStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Rejet immédiat : pas de timeout à attendre pour un device muet.
    #[error("device {0} is offline")]
    DeviceOffline(String),
    #[error("command transport unavailable")]
    Dispatch,
}

/// Cible adressable d'une commande côté device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandTarget {
    Gpio(u8),
}

impl CommandTarget {
    fn field(&self) -> Field {
        match self {
            CommandTarget::Gpio(pin) => Field::Gpio(*pin),
        }
    }
}

struct PendingCommand {
    request_id: Uuid,
    requested: Value,
    issued_at: OffsetDateTime,
    timer: AbortHandle,
}

pub struct CommandReconciler {
    pending: Shared<HashMap<(String, CommandTarget), PendingCommand>>,
    store: Arc<DeviceStateStore>,
    presence: Arc<PresenceTracker>,
    feed: Arc<StateFeed>,
    outbound_tx: mpsc::UnboundedSender<OutboundCommand>,
    default_timeout_ms: u64,
}

impl CommandReconciler {
    pub fn new(
        store: Arc<DeviceStateStore>,
        presence: Arc<PresenceTracker>,
        feed: Arc<StateFeed>,
        outbound_tx: mpsc::UnboundedSender<OutboundCommand>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            pending: new_state(HashMap::new()),
            store,
            presence,
            feed,
            outbound_tx,
            default_timeout_ms,
        }
    }

    /// Émet une commande : rejet immédiat si le device est offline,
    /// remplacement atomique de toute commande pendante sur la même cible,
    /// publication optimiste, puis envoi sortant fire-and-forget.
    pub fn issue(
        self: &Arc<Self>,
        device_id: &str,
        target: CommandTarget,
        requested: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Uuid, CommandError> {
        if !self.presence.is_online(device_id) {
            return Err(CommandError::DeviceOffline(device_id.to_string()));
        }

        let request_id = Uuid::new_v4();
        let timeout_ms = timeout_ms.unwrap_or(self.default_timeout_ms);
        let issued_at = OffsetDateTime::now_utc();
        let key = (device_id.to_string(), target.clone());

        {
            let mut pending = self.pending.lock();
            if let Some(superseded) = pending.remove(&key) {
                superseded.timer.abort();
                println!(
                    "[commands] command {} on {device_id} superseded by {request_id} after {}ms",
                    superseded.request_id,
                    (issued_at - superseded.issued_at).whole_milliseconds()
                );
            }
            // le timer est créé sous le lock : l'entrée existe forcément
            // avant que l'expiry puisse la chercher
            let reconciler = Arc::clone(self);
            let timer_key = key.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
                reconciler.expire(&timer_key, request_id);
            });
            pending.insert(
                key,
                PendingCommand {
                    request_id,
                    requested: requested.clone(),
                    issued_at,
                    timer: handle.abort_handle(),
                },
            );
        }

        self.feed.publish(StateChange::Updated {
            device_id: device_id.to_string(),
            field: target.field(),
            value: requested.clone(),
            confidence: Confidence::Optimistic,
        });

        let payload = command_payload(&target, request_id, &requested, issued_at);
        let sent = self
            .outbound_tx
            .send(OutboundCommand { device_id: device_id.to_string(), payload });
        if sent.is_err() {
            // transport fermé : on retire la commande qu'on vient d'enregistrer
            let mut pending = self.pending.lock();
            let key = (device_id.to_string(), target);
            let still_ours =
                matches!(pending.get(&key), Some(cmd) if cmd.request_id == request_id);
            if still_ours {
                if let Some(cmd) = pending.remove(&key) {
                    cmd.timer.abort();
                }
            }
            return Err(CommandError::Dispatch);
        }

        println!("[commands] issued {request_id} to {device_id} (timeout {timeout_ms}ms)");
        Ok(request_id)
    }

    /// Appelé par le pipeline pour chaque valeur autoritative fusionnée sur
    /// une cible commandable. Sans commande pendante : simple passage.
    /// Avec : confirmation si la valeur correspond, sinon le rapport gagne
    /// quand même et la commande est abandonnée sans rollback.
    pub fn on_authoritative_report(&self, device_id: &str, target: &CommandTarget, reported: &Value) {
        let resolved = {
            let mut pending = self.pending.lock();
            let key = (device_id.to_string(), target.clone());
            match pending.remove(&key) {
                Some(cmd) => {
                    cmd.timer.abort();
                    Some((cmd.request_id, cmd.requested == *reported))
                }
                None => None,
            }
        };
        match resolved {
            Some((request_id, true)) => {
                println!("[commands] command {request_id} on {device_id} confirmed");
            }
            Some((request_id, false)) => {
                // override manuel ou message retenu : le device a raison
                println!(
                    "[commands] device {device_id} reported {reported}, dropping pending command {request_id}"
                );
            }
            None => {}
        }
    }

    /// Chemin timeout. Ne retire l'entrée que si le request_id correspond
    /// encore : une commande remplacée à l'instant où son timer part ne
    /// produit jamais un rollback en plus de la résolution du remplaçant.
    fn expire(&self, key: &(String, CommandTarget), request_id: Uuid) {
        let expired = {
            let mut pending = self.pending.lock();
            let still_ours =
                matches!(pending.get(key), Some(cmd) if cmd.request_id == request_id);
            if still_ours {
                pending.remove(key)
            } else {
                None
            }
        };
        if expired.is_some() {
            let (device_id, target) = key;
            let restored = self
                .store
                .get(device_id)
                .and_then(|state| match target {
                    CommandTarget::Gpio(pin) => {
                        state.gpio.get(pin).map(|level| Value::from(*level))
                    }
                })
                .unwrap_or(Value::Null);
            eprintln!(
                "[commands] command {request_id} on {device_id} timed out, rolling back to {restored}"
            );
            self.feed.publish(StateChange::RolledBack {
                device_id: device_id.clone(),
                field: target.field(),
                value: restored,
            });
        }
    }

    pub fn has_pending(&self, device_id: &str, target: &CommandTarget) -> bool {
        self.pending
            .lock()
            .contains_key(&(device_id.to_string(), target.clone()))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Payload `cmd` attendu par le firmware : type, reqId, pin, value.
fn command_payload(
    target: &CommandTarget,
    request_id: Uuid,
    requested: &Value,
    issued_at: OffsetDateTime,
) -> Value {
    match target {
        CommandTarget::Gpio(pin) => serde_json::json!({
            "type": "gpio",
            "reqId": request_id.to_string(),
            "pin": pin,
            "value": requested,
            "timestamp": issued_at.format(&Rfc3339).unwrap_or_default(),
        }),
    }
}
