//! Kubernetes controllers for watched resources

pub mod registry_config;
pub mod retry;

use std::sync::Arc;

use kube::Client;

use crate::reconciler::MirrorReconciler;
use crate::settings::OperatorSettings;

use retry::RetryTracker;

/// Shared state for all controllers
pub struct ControllerContext {
    /// Operator settings
    pub settings: Arc<OperatorSettings>,
    /// Bundle and discovery orchestration
    pub reconciler: Arc<MirrorReconciler>,
    /// Kubernetes API client (shared across controllers)
    pub kube_client: Client,
    /// Per-resource retry counters
    pub retry_tracker: Arc<RetryTracker>,
}
