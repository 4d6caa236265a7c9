//! Hooks for the collaborators the transport reports to.

use crate::error::WsError;
use tracing::{error, warn};

/// Receives conditions the UI has to surface.
///
/// `on_unauthorized` is raised when a leader's server socket closes cleanly,
/// which is how the bridge ends an expired session. Everything else arrives
/// through `on_error`.
#[cfg_attr(test, mockall::automock)]
pub trait TransportObserver: Send + Sync {
    fn on_unauthorized(&self, dashboard_id: &str);

    fn on_error(&self, dashboard_id: &str, error: &WsError);
}

/// Observer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl TransportObserver for LoggingObserver {
    fn on_unauthorized(&self, dashboard_id: &str) {
        warn!(%dashboard_id, "Session unauthorized");
    }

    fn on_error(&self, dashboard_id: &str, error: &WsError) {
        error!(%dashboard_id, %error, "Transport error");
    }
}
