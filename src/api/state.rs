//! Shared handles for API handlers.

use crate::clock::Clock;
use crate::dispatcher::Dispatcher;
use crate::store::TaskStore;
use std::sync::Arc;

/// Handle bundle built by the composition root and shared with every
/// handler through axum state.
pub struct ApiState {
    pub store: TaskStore,
    pub dispatcher: Dispatcher,
    pub clock: Arc<dyn Clock>,
}
