// Core layer - configuration and the typed document model
pub mod config;
pub mod templates;

// Infrastructure
pub mod database;
pub mod platform;
pub mod store;

// Features
pub mod components;
pub mod features;
pub mod forum_analysis;
pub mod reconcile;

// Application layer
pub mod commands;
pub mod dashboard;

pub use config::AppConfig;
pub use features::{Feature, FeatureRegistry};
pub use reconcile::{ReconcileOutcome, ReconcileSummary, Reconciler};
