/**
 * STATE FEED - Flux publish/subscribe des changements d'état vers l'UI
 *
 * RÔLE : Livrer chaque changement de la vue fusionnée (deviceId, champ,
 * valeur, confiance) aux widgets abonnés, avec handle de désabonnement.
 *
 * GARANTIE : un abonné mort ou fermé n'empêche jamais la livraison aux
 * autres (senders unbounded, jamais bloquants, élagués à l'envoi).
 */

use crate::models::Field;
use crate::state::{new_state, Shared};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Provenance d'une valeur publiée : rapportée par le device lui-même,
/// ou supposée localement en attente de confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Confidence {
    #[serde(rename = "authoritative")]
    Authoritative,
    #[serde(rename = "optimistic")]
    Optimistic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum StateChange {
    /// Mise à jour ordinaire de la vue fusionnée.
    #[serde(rename = "updated")]
    Updated {
        device_id: String,
        field: Field,
        value: Value,
        confidence: Confidence,
    },
    /// Rollback explicite : la valeur optimiste est annulée et remplacée
    /// par la dernière valeur autoritative connue (null si jamais observée).
    #[serde(rename = "rolled_back")]
    RolledBack {
        device_id: String,
        field: Field,
        value: Value,
    },
}

#[derive(Debug)]
pub struct SubscriptionId(u64);

pub struct StateFeed {
    next_id: AtomicU64,
    subscribers: Shared<HashMap<u64, mpsc::UnboundedSender<StateChange>>>,
}

impl StateFeed {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: new_state(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<StateChange>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert(id, tx);
        (SubscriptionId(id), rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().remove(&id.0);
    }

    pub fn publish(&self, change: StateChange) {
        // un receiver droppé rend send() Err : on l'élague au passage
        self.subscribers
            .lock()
            .retain(|_, tx| tx.send(change.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(device: &str) -> StateChange {
        StateChange::Updated {
            device_id: device.to_string(),
            field: Field::Online,
            value: json!(true),
            confidence: Confidence::Authoritative,
        }
    }

    #[test]
    fn test_delivers_to_all_subscribers() {
        let feed = StateFeed::new();
        let (_a, mut rx_a) = feed.subscribe();
        let (_b, mut rx_b) = feed.subscribe();

        feed.publish(change("pump-1"));

        assert_eq!(rx_a.try_recv().unwrap(), change("pump-1"));
        assert_eq!(rx_b.try_recv().unwrap(), change("pump-1"));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let feed = StateFeed::new();
        let (id_a, mut rx_a) = feed.subscribe();
        let (_b, mut rx_b) = feed.subscribe();

        feed.unsubscribe(id_a);
        feed.publish(change("pump-1"));

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), change("pump-1"));
    }

    #[test]
    fn test_dropped_receiver_does_not_block_others() {
        let feed = StateFeed::new();
        let (_a, rx_a) = feed.subscribe();
        let (_b, mut rx_b) = feed.subscribe();

        drop(rx_a);
        feed.publish(change("pump-1"));
        assert_eq!(rx_b.try_recv().unwrap(), change("pump-1"));
        // l'abonné mort a été élagué
        assert_eq!(feed.subscriber_count(), 1);
    }
}
