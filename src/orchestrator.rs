// src/orchestrator.rs
use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::connection::ChannelManager;
use crate::monitors::updates::{MarketUpdate, UpdateMonitor};

pub struct Orchestrator {
    channel: Arc<ChannelManager>,
    monitor_handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub async fn new(settings: &Settings) -> Result<Self> {
        let channel = Arc::new(ChannelManager::new(settings).await?);
        Ok(Self {
            channel,
            monitor_handles: Vec::new(),
        })
    }

    pub fn channel(&self) -> Arc<ChannelManager> {
        Arc::clone(&self.channel)
    }

    pub async fn setup_update_monitor(&mut self) -> Result<()> {
        info!("Setting up market update monitor...");

        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<MarketUpdate>();

        let monitor = UpdateMonitor::new(update_tx);
        monitor.attach(&self.channel).await;

        // Spawn a task to process updates
        let handle = tokio::spawn(async move {
            info!("Market update processor started");
            while let Some(update) = update_rx.recv().await {
                if let Err(e) = handle_market_update(update) {
                    error!("Error processing market update: {e:#}");
                }
            }
            info!("Market update processor stopped");
        });

        self.monitor_handles.push(handle);

        Ok(())
    }

    pub async fn run(mut self) -> Result<()> {
        self.channel.connect().await?;
        info!("Channel started. Press Ctrl+C to stop...");

        tokio::signal::ctrl_c().await?;

        info!("Shutdown signal received, closing channel...");
        self.channel.shutdown().await?;

        // Drop our channel handle so the subscription registry (and with it
        // the monitors' senders) goes away and the processors drain out.
        drop(self.channel);

        let shutdown_timeout = tokio::time::Duration::from_secs(5);
        for handle in self.monitor_handles.drain(..) {
            if tokio::time::timeout(shutdown_timeout, handle).await.is_err() {
                error!("Timeout waiting for task to complete, forcing shutdown");
            }
        }

        info!("Channel stopped, shutting down gracefully");

        Ok(())
    }
}

fn handle_market_update(update: MarketUpdate) -> Result<()> {
    match update {
        MarketUpdate::Pattern {
            sequence_number,
            update,
        } => {
            info!(
                "#{sequence_number} pattern: {} on {} (confidence {:?})",
                update.pattern, update.symbol, update.confidence
            );
        }
        MarketUpdate::Signal {
            sequence_number,
            update,
        } => {
            info!(
                "#{sequence_number} signal: {} {} @ {:?}",
                update.action, update.symbol, update.price
            );
        }
        MarketUpdate::Portfolio {
            sequence_number,
            update,
        } => {
            info!(
                "#{sequence_number} portfolio: equity {:?}, {} positions",
                update.equity,
                update.positions.len()
            );
        }
    }
    Ok(())
}
