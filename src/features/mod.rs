//! # Feature: Feature Registry
//!
//! Every long-lived feature of the bot is listed explicitly at startup and
//! driven through the [`Feature`] trait: `load` once before the client
//! connects, `on_ready` once per process after the first `ready` event, and
//! `reconcile` on demand.

pub mod managed;

use crate::reconcile::ReconcileSummary;
use anyhow::Result;
use futures::future::join_all;
use log::{error, info};
use serenity::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[async_trait]
pub trait Feature: Send + Sync {
    fn name(&self) -> &str;

    /// Read persisted state; called before the client connects
    async fn load(&self) -> Result<()>;

    /// Publish and register persistent components
    async fn on_ready(&self) -> Result<()>;

    /// Converge the current document onto the server
    async fn reconcile(&self) -> Result<ReconcileSummary>;
}

#[derive(Default)]
pub struct FeatureRegistry {
    features: Vec<Arc<dyn Feature>>,
    persistent_components_added: AtomicBool,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, feature: Arc<dyn Feature>) {
        info!("Registering feature {}", feature.name());
        self.features.push(feature);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Feature>> {
        self.features.iter().find(|f| f.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.name()).collect()
    }

    pub async fn load_all(&self) -> Result<()> {
        for feature in &self.features {
            feature.load().await?;
            info!("[{}] Loaded", feature.name());
        }
        Ok(())
    }

    /// Run every feature's `on_ready` the first time the bot becomes ready.
    ///
    /// Returns `false` when a previous `ready` already did, which is what a
    /// gateway reconnect looks like.
    pub async fn on_ready(&self) -> bool {
        if self
            .persistent_components_added
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Persistent components already added, skipping");
            return false;
        }

        // Each feature only touches its own messages
        let results = join_all(self.features.iter().map(|f| f.on_ready())).await;
        for (feature, result) in self.features.iter().zip(results) {
            if let Err(e) = result {
                error!("[{}] Failed to publish on ready: {:#}", feature.name(), e);
            }
        }
        true
    }

    pub fn persistent_components_added(&self) -> bool {
        self.persistent_components_added.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingFeature {
        name: &'static str,
        ready_calls: AtomicUsize,
    }

    #[async_trait]
    impl Feature for CountingFeature {
        fn name(&self) -> &str {
            self.name
        }

        async fn load(&self) -> Result<()> {
            Ok(())
        }

        async fn on_ready(&self) -> Result<()> {
            self.ready_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reconcile(&self) -> Result<ReconcileSummary> {
            Ok(ReconcileSummary::default())
        }
    }

    fn counting(name: &'static str) -> Arc<CountingFeature> {
        Arc::new(CountingFeature {
            name,
            ready_calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_reconnect_does_not_rerun_on_ready() {
        let embeds = counting("embed_message");
        let buttons = counting("role_buttons");
        let mut registry = FeatureRegistry::new();
        registry.register(embeds.clone());
        registry.register(buttons.clone());

        assert!(!registry.persistent_components_added());
        assert!(registry.on_ready().await);
        assert!(!registry.on_ready().await);
        assert!(!registry.on_ready().await);

        assert!(registry.persistent_components_added());
        assert_eq!(embeds.ready_calls.load(Ordering::SeqCst), 1);
        assert_eq!(buttons.ready_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lookup_by_name_keeps_registration_order() {
        let mut registry = FeatureRegistry::new();
        registry.register(counting("embed_message"));
        registry.register(counting("role_buttons"));

        assert_eq!(registry.names(), vec!["embed_message", "role_buttons"]);
        assert!(registry.get("role_buttons").is_some());
        assert!(registry.get("forum_analysis").is_none());
    }
}
