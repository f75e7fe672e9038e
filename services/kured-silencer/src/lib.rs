//! kured-silencer Library
//!
//! kured-silencer keeps Alertmanager quiet while nodes reboot. kured marks a
//! node with a label before draining and rebooting it; while the label is
//! present the silencer holds one silence per configured severity for that
//! node, and lifts them a short buffer after the label is removed.
//!
//! ## Architecture
//!
//! ```text
//! LeaderElector                 (one active replica per cluster)
//! └── Reconciler                (one per leadership term)
//!     ├── WatchSource           (node label subscriptions)
//!     └── EventHandler          (label event -> silence operations)
//!         ├── AlertSilencer     (Alertmanager v2 API)
//!         └── SilenceStore      (node -> open silence ids)
//! ```
//!
//! ## Modules
//!
//! - `alertmanager`: Silence creation and deletion over the Alertmanager API
//! - `cluster`: Kubernetes client construction
//! - `config`: Command-line and environment configuration
//! - `handler`: Per-event silence bookkeeping
//! - `leader`: Lease-based leader election
//! - `reconciler`: The watch/handle loop
//! - `store`: In-memory record of open silences
//! - `watch`: Node label subscriptions

pub mod alertmanager;
pub mod cluster;
pub mod config;
pub mod handler;
pub mod leader;
pub mod reconciler;
pub mod store;
pub mod watch;

// Re-export commonly used types
pub use alertmanager::{AlertSilencer, AlertmanagerClient, Matcher, SilenceTemplate, SilencerError};
pub use handler::{EventHandler, HandleError, HandlerConfig, Outcome};
pub use leader::{ElectionConfig, KubeLeaseLock, LeaderElector, LeaseLock};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use store::{SilenceId, SilenceStore};
pub use watch::{LabelEvent, LabelEventKind, NodeLabelWatch, Subscription, WatchSource};
