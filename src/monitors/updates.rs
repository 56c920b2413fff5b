// src/monitors/updates.rs
use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::connection::{ChannelManager, EventFilter, SubscriptionId};
use crate::message::Message;

pub const PATTERN_UPDATE: &str = "pattern_update";
pub const SIGNAL_UPDATE: &str = "signal_update";
pub const PORTFOLIO_UPDATE: &str = "portfolio_update";

/// A detected chart pattern on a watched symbol.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternUpdate {
    pub symbol: String,
    pub pattern: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub timeframe: Option<String>,
}

/// A buy/sell signal emitted by the strategy engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalUpdate {
    pub symbol: String,
    pub action: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    #[serde(default)]
    pub average_price: Option<f64>,
}

/// A snapshot of the account after a fill or revaluation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioUpdate {
    #[serde(default)]
    pub equity: Option<f64>,
    #[serde(default)]
    pub cash: Option<f64>,
    #[serde(default)]
    pub positions: Vec<Position>,
}

// The event structure that is sent to the update processor
#[derive(Debug, Clone)]
pub enum MarketUpdate {
    Pattern {
        sequence_number: u64,
        update: PatternUpdate,
    },
    Signal {
        sequence_number: u64,
        update: SignalUpdate,
    },
    Portfolio {
        sequence_number: u64,
        update: PortfolioUpdate,
    },
}

/// Turn a raw channel message into a typed market update.
pub fn parse_update(message: &Message) -> Result<MarketUpdate> {
    let payload = Value::Object(message.payload.clone());
    let sequence_number = message.sequence_number;

    match message.kind.as_str() {
        PATTERN_UPDATE => Ok(MarketUpdate::Pattern {
            sequence_number,
            update: serde_json::from_value(payload)?,
        }),
        SIGNAL_UPDATE => Ok(MarketUpdate::Signal {
            sequence_number,
            update: serde_json::from_value(payload)?,
        }),
        PORTFOLIO_UPDATE => Ok(MarketUpdate::Portfolio {
            sequence_number,
            update: serde_json::from_value(payload)?,
        }),
        other => anyhow::bail!("not a market update frame: {other}"),
    }
}

/// Subscribes the three market update kinds on the channel and forwards the
/// parsed updates to a processor over an mpsc channel.
pub struct UpdateMonitor {
    sender: mpsc::UnboundedSender<MarketUpdate>,
}

impl UpdateMonitor {
    pub fn new(sender: mpsc::UnboundedSender<MarketUpdate>) -> Self {
        Self { sender }
    }

    /// Register one handler per update kind. Returns the subscription ids
    /// so the caller can detach the monitor again.
    pub async fn attach(&self, channel: &ChannelManager) -> Vec<SubscriptionId> {
        let mut ids = Vec::new();
        for kind in [PATTERN_UPDATE, SIGNAL_UPDATE, PORTFOLIO_UPDATE] {
            let sender = self.sender.clone();
            let id = channel
                .subscribe(
                    EventFilter::Type(kind.to_string()),
                    format!("market update monitor ({kind})"),
                    move |message| {
                        let update = parse_update(&message)?;
                        sender
                            .send(update)
                            .map_err(|_| anyhow::anyhow!("update processor is gone"))
                    },
                )
                .await;
            ids.push(id);
        }
        ids
    }
}
