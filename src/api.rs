//! HTTP API
//!
//! Every session route acts for the user named in the `x-user-id` header
//! and only reaches sessions that user owns.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::auth::ToolAuthorizer;
use crate::runtime::SharedRouter;
use crate::session::SessionStore;
use crate::storage::FileStore;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<SharedRouter>,
    pub sessions: Arc<SessionStore>,
    pub authorizer: Arc<ToolAuthorizer>,
    pub files: Arc<dyn FileStore>,
}
