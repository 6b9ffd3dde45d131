/// Broadcast channel between the processes of one game session.
///
/// Every connected process sees every envelope except its own. `LocalBus`
/// provides this over a tokio broadcast channel for in-process setups and
/// tests.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::latest::LatestRollEntry;
use crate::normalizer::RollPayload;
use crate::stats::GlobalStats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    /// Payloads relayed to the writer by the process that saw the roll.
    Rolls { data: Vec<RollPayload> },
    /// Full statistics pushed by the writer.
    StatsSnapshot {
        data: GlobalStats,
        #[serde(rename = "senderId")]
        sender_id: Option<String>,
    },
    /// The writer persisted new statistics.
    StatsUpdated,
    LatestRoll {
        data: LatestRollEntry,
        #[serde(rename = "senderId")]
        sender_id: Option<String>,
    },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Rolls { .. } => "rolls",
            Envelope::StatsSnapshot { .. } => "statsSnapshot",
            Envelope::StatsUpdated => "statsUpdated",
            Envelope::LatestRoll { .. } => "latestRoll",
        }
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to decode channel envelope")
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode channel envelope")
    }
}

pub trait Channel: Send + Sync {
    fn emit(&self, envelope: Envelope) -> Result<()>;
}

/// Channel for a process running alone.
pub struct NullChannel;

impl Channel for NullChannel {
    fn emit(&self, envelope: Envelope) -> Result<()> {
        debug!("No peers connected, dropping {} envelope", envelope.kind());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: String,
    pub envelope: Envelope,
}

/// In-process bus shared by several endpoints.
#[derive(Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Delivery>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        LocalBus { sender }
    }

    /// Connects a process running as `user_id`.
    pub fn endpoint(&self, user_id: &str) -> BusEndpoint {
        BusEndpoint {
            user_id: user_id.to_string(),
            sender: self.sender.clone(),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Clone)]
pub struct BusEndpoint {
    user_id: String,
    sender: broadcast::Sender<Delivery>,
}

impl BusEndpoint {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Receives envelopes emitted after this call by other endpoints.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            user_id: self.user_id.clone(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl Channel for BusEndpoint {
    fn emit(&self, envelope: Envelope) -> Result<()> {
        let kind = envelope.kind();
        let delivery = Delivery {
            from: self.user_id.clone(),
            envelope,
        };
        if self.sender.send(delivery).is_err() {
            debug!("No subscribers for {} envelope", kind);
        }
        Ok(())
    }
}

pub struct Subscription {
    user_id: String,
    receiver: broadcast::Receiver<Delivery>,
}

impl Subscription {
    /// Next envelope from another endpoint, or None once the bus is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(delivery) if delivery.from == self.user_id => continue,
                Ok(delivery) => return Some(delivery),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Channel subscriber for {} lagged, {} envelopes lost", self.user_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let encoded = Envelope::StatsUpdated.encode().unwrap();
        assert_eq!(encoded, r#"{"type":"statsUpdated"}"#);

        let latest = Envelope::decode(
            r#"{"type":"latestRoll","data":{"userId":"p1","results":{"d20":{"20":1}}},"senderId":"p1"}"#,
        )
        .unwrap();
        let Envelope::LatestRoll { data, sender_id } = latest else {
            panic!("expected latestRoll");
        };
        assert_eq!(sender_id.as_deref(), Some("p1"));
        assert_eq!(data.action_type, "other");

        let rolls = Envelope::decode(
            &json!({"type": "rolls", "data": [{"userId": "p1", "actionType": "attack", "rolls": 1, "results": {"d20": {"7": 1}}}]})
                .to_string(),
        )
        .unwrap();
        assert_eq!(rolls.kind(), "rolls");

        let snapshot = Envelope::decode(r#"{"type":"statsSnapshot","data":{"totals":{"rolls":"3"}}}"#).unwrap();
        let Envelope::StatsSnapshot { data, sender_id } = snapshot else {
            panic!("expected statsSnapshot");
        };
        assert_eq!(data.aggregate.totals.rolls, 3);
        assert_eq!(sender_id, None);

        assert!(Envelope::decode(r#"{"type":"roll","data":{}}"#).is_err());
    }

    #[tokio::test]
    async fn test_bus_skips_own_envelopes() {
        let bus = LocalBus::default();
        let gm = bus.endpoint("gm");
        let player = bus.endpoint("p1");
        let mut gm_inbox = gm.subscribe();
        let mut player_inbox = player.subscribe();

        gm.emit(Envelope::StatsUpdated).unwrap();
        player.emit(Envelope::Rolls { data: Vec::new() }).unwrap();

        let received = player_inbox.recv().await.unwrap();
        assert_eq!(received.from, "gm");
        assert_eq!(received.envelope, Envelope::StatsUpdated);

        let received = gm_inbox.recv().await.unwrap();
        assert_eq!(received.from, "p1");
        assert_eq!(received.envelope.kind(), "rolls");
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = LocalBus::new(4);
        let endpoint = bus.endpoint("p1");
        let mut inbox = endpoint.subscribe();
        drop(endpoint);
        drop(bus);
        assert!(inbox.recv().await.is_none());
    }

    #[test]
    fn test_emit_without_subscribers() {
        assert!(LocalBus::default().endpoint("gm").emit(Envelope::StatsUpdated).is_ok());
        assert!(NullChannel.emit(Envelope::StatsUpdated).is_ok());
    }
}
