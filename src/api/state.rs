use std::sync::Arc;

use tokio::sync::watch;

use crate::pipeline::Pipeline;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub pipeline: Arc<Pipeline>,
    /// Scan cancellation signal shared with the serve loop.
    pub cancel: watch::Receiver<bool>,
}
