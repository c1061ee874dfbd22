use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use orchestrator::ExecEventListener;
use runtime_core::ExecEvent;
use tracing::warn;

use crate::error::Result;
use crate::service::HandleService;

/// Feeds a runner's events into the handle service, one handle per
/// correlation id.
pub struct HandleForwarder {
    service: HandleService,
    handles: Mutex<HashMap<String, String>>,
}

impl HandleForwarder {
    pub fn new(service: HandleService) -> Self {
        Self {
            service,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> &HandleService {
        &self.service
    }

    /// Handle id issued for `correlation_id`, if any event has been seen.
    pub fn handle_for(&self, correlation_id: &str) -> Option<String> {
        self.handles().get(correlation_id).cloned()
    }

    /// Close the handle for `correlation_id`. The mapping is kept so the
    /// handle can still be looked up and replayed.
    pub fn close(&self, correlation_id: &str) -> Result<()> {
        match self.handle_for(correlation_id) {
            Some(handle_id) => self.service.close(&handle_id),
            None => Ok(()),
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExecEventListener for HandleForwarder {
    fn on_event(&self, event: &ExecEvent) {
        let handle_id = {
            let mut handles = self.handles();
            handles
                .entry(event.correlation_id.clone())
                .or_insert_with(|| self.service.issue_handle(&event.correlation_id).id)
                .clone()
        };

        if let Err(e) = self.service.publish(&handle_id, event.clone()) {
            warn!(
                handle_id = %handle_id,
                correlation_id = %event.correlation_id,
                error = %e,
                "Failed to forward exec event"
            );
        }
    }
}
