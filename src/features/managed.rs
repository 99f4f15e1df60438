//! # Feature: Managed Messages
//!
//! The embed-message and role-button features. Each one is a single owner task
//! holding the live document and the applied snapshot; the rest of the bot
//! talks to it through [`ManagedMessages`], which sends commands over an mpsc
//! channel and reads the current document from a watch channel.
//!
//! Once the bot is ready the task also re-reads the document every poll
//! interval and reconciles when it changed on disk, when the feature was
//! switched back on in the global config, or when the last pass left groups
//! that did not reach the server.

use super::Feature;
use crate::reconcile::{ReconcileOutcome, ReconcileSummary, Reconciler};
use crate::store::ConfigStore;
use crate::templates::FeatureDocument;
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde_json::Value;
use serenity::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub const EMBED_MESSAGE: &str = "embed_message";
pub const ROLE_BUTTONS: &str = "role_buttons";

/// Global switches live in this document under `cogs.<feature>.enabled`
pub const GLOBAL_CONFIG: &str = "global_config";

/// Result of one poll of the document on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    /// Changed on disk but stored only, the bot is not ready yet
    Stored,
    Applied(ReconcileSummary),
    /// Changed on disk but rejected by validation
    Invalid,
    /// Could not be read or parsed; the in-memory copy is kept
    Unreadable,
}

enum Command {
    Load(oneshot::Sender<Result<()>>),
    Ready(oneshot::Sender<Result<ReconcileSummary>>),
    Reconcile(oneshot::Sender<Result<ReconcileSummary>>),
    Poll(oneshot::Sender<Result<PollOutcome>>),
}

/// Handle to a managed-message feature task
pub struct ManagedMessages {
    name: String,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<FeatureDocument>,
}

impl ManagedMessages {
    /// Start the owner task for `name`
    pub fn spawn(
        name: impl Into<String>,
        store: ConfigStore,
        reconciler: Reconciler,
        poll_interval: Duration,
    ) -> Self {
        let name = name.into();
        let (commands, receiver) = mpsc::channel(16);
        let (snapshot_tx, snapshot) = watch::channel(FeatureDocument::default());

        let owner = Owner {
            name: name.clone(),
            store,
            reconciler,
            current: Value::Object(Default::default()),
            desired: FeatureDocument::default(),
            applied: FeatureDocument::default(),
            snapshot: snapshot_tx,
            ready: false,
            enabled: true,
            dirty: false,
        };
        tokio::spawn(owner.run(receiver, poll_interval));

        ManagedMessages {
            name,
            commands,
            snapshot,
        }
    }

    /// Current document, including back-filled ids
    pub fn snapshot(&self) -> FeatureDocument {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeatureDocument> {
        self.snapshot.clone()
    }

    /// Re-read the document now instead of waiting for the next tick
    pub async fn poll(&self) -> Result<PollOutcome> {
        self.request(Command::Poll).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| anyhow!("[{}] Feature task has stopped", self.name))?;
        response
            .await
            .map_err(|_| anyhow!("[{}] Feature task dropped the request", self.name))?
    }
}

#[async_trait]
impl Feature for ManagedMessages {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<()> {
        self.request(Command::Load).await
    }

    async fn on_ready(&self) -> Result<()> {
        let summary = self.request(Command::Ready).await?;
        debug!("[{}] Ready: {}", self.name, summary);
        Ok(())
    }

    async fn reconcile(&self) -> Result<ReconcileSummary> {
        self.request(Command::Reconcile).await
    }
}

struct Owner {
    name: String,
    store: ConfigStore,
    reconciler: Reconciler,
    /// Raw document as last read from or written to disk
    current: Value,
    desired: FeatureDocument,
    applied: FeatureDocument,
    snapshot: watch::Sender<FeatureDocument>,
    ready: bool,
    /// Global switch as of the last look
    enabled: bool,
    /// Some groups failed on the last pass
    dirty: bool,
}

impl Owner {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, poll_interval: Duration) {
        let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick(), if self.ready => {
                    if let Err(e) = self.poll().await {
                        warn!("[{}] Poll failed: {:#}", self.name, e);
                    }
                }
            }
        }
        debug!("[{}] Feature task stopped", self.name);
    }

    async fn handle(&mut self, command: Command) {
        // A dropped receiver only means the caller stopped waiting
        match command {
            Command::Load(reply) => {
                let _ = reply.send(self.load().await);
            }
            Command::Ready(reply) => {
                self.ready = true;
                let _ = reply.send(self.apply().await);
            }
            Command::Reconcile(reply) => {
                let _ = reply.send(self.apply().await);
            }
            Command::Poll(reply) => {
                let _ = reply.send(self.poll().await);
            }
        }
    }

    async fn load(&mut self) -> Result<()> {
        if self.store.resolve(&self.name).await?.is_none() {
            warn!("[{}] No schema found, the dashboard will not serve this feature", self.name);
        }

        self.current = self.store.read_document(&self.name).await;
        self.desired = match FeatureDocument::from_value(&self.current) {
            Ok(document) => document,
            Err(e) => {
                warn!("[{}] Invalid document, starting empty: {:#}", self.name, e);
                FeatureDocument::default()
            }
        };

        let applied = self.store.read_applied(&self.name).await;
        self.applied = FeatureDocument::from_value(&applied).unwrap_or_else(|e| {
            warn!("[{}] Invalid applied snapshot, ignoring it: {:#}", self.name, e);
            FeatureDocument::default()
        });

        self.snapshot.send_replace(self.desired.clone());
        Ok(())
    }

    async fn poll(&mut self) -> Result<PollOutcome> {
        let value = match self.store.read_document_strict(&self.name).await {
            Ok(value) => value,
            Err(e) => {
                warn!("[{}] Keeping the loaded document: {:#}", self.name, e);
                return Ok(PollOutcome::Unreadable);
            }
        };
        let enabled = self.read_enabled().await;
        let switched_on = enabled && !self.enabled;
        self.enabled = enabled;

        if value == self.current {
            if self.ready && (self.dirty || switched_on) {
                info!("[{}] Re-applying the unchanged document", self.name);
                return Ok(PollOutcome::Applied(self.apply().await?));
            }
            return Ok(PollOutcome::Unchanged);
        }

        info!("[{}] Document changed on disk, reloading", self.name);
        self.current = value;
        let document = match FeatureDocument::from_value(&self.current) {
            Ok(document) => document,
            Err(e) => {
                warn!("[{}] Not applying invalid document: {:#}", self.name, e);
                return Ok(PollOutcome::Invalid);
            }
        };
        self.desired = document;
        self.snapshot.send_replace(self.desired.clone());

        if !self.ready {
            return Ok(PollOutcome::Stored);
        }
        Ok(PollOutcome::Applied(self.apply().await?))
    }

    async fn apply(&mut self) -> Result<ReconcileSummary> {
        self.enabled = self.read_enabled().await;
        if !self.enabled {
            debug!("[{}] Disabled in global config, skipping update", self.name);
            return Ok(ReconcileSummary::default());
        }

        let ReconcileOutcome {
            document,
            applied,
            summary,
        } = self
            .reconciler
            .reconcile(self.desired.clone(), &self.applied)
            .await;

        let value = document.to_value()?;
        self.store
            .persist_applied(&self.name, &value, &applied.to_value()?)
            .await?;

        self.dirty = summary.failed > 0;
        if self.dirty {
            warn!(
                "[{}] {} group(s) did not reach the server, retrying on the next poll",
                self.name, summary.failed
            );
        }
        self.current = value;
        self.desired = document;
        self.applied = applied;
        self.snapshot.send_replace(self.desired.clone());
        Ok(summary)
    }

    async fn read_enabled(&self) -> bool {
        let global = self.store.read_document(GLOBAL_CONFIG).await;
        feature_enabled(&global, &self.name)
    }
}

/// `cogs.<name>.enabled` of the global config; anything missing means enabled
pub fn feature_enabled(global: &Value, name: &str) -> bool {
    global
        .get("cogs")
        .and_then(|cogs| cogs.get(name))
        .and_then(|cog| cog.get("enabled"))
        .and_then(Value::as_bool)
        .unwrap_or(true)
}
