use std::sync::Arc;

use crate::orchestrator::Coordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}
