use tracing::{info, warn};

use super::{Dispatcher, ReplyCallback, ServiceCall};

// Dry-run dispatcher: logs every call and never answers lookups
#[derive(Debug, Default)]
pub struct LogDispatcher;

impl Dispatcher for LogDispatcher {
    fn dispatch(&self, call: ServiceCall, on_result: Option<ReplyCallback>) {
        info!("Dispatch (dry run): {}", call);
        if on_result.is_some() {
            warn!("Dry run dispatcher drops the reply for {}", call);
        }
    }
}
