//! Services shared by the streams of one application

use std::sync::Arc;

use parking_lot::RwLock;

use crate::bandwidth::BandwidthControlService;
use crate::connection::ConsumerService;
use crate::registry::ProviderService;
use crate::scheduling::{Clock, Scheduler};

use super::config::EngineConfig;
use super::handler::{log_failure, HandlerResult, StreamAwareHandler, StreamInfo};

/// Collaborators every stream needs
#[derive(Clone)]
pub struct StreamServices {
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
    pub providers: Arc<ProviderService>,
    pub consumers: ConsumerService,
    pub bandwidth: Arc<dyn BandwidthControlService>,
    pub engine_config: EngineConfig,
}

/// Application scope: a name, its services and an optional handler
pub struct StreamScope {
    app: String,
    services: StreamServices,
    handler: RwLock<Option<Arc<dyn StreamAwareHandler>>>,
}

impl StreamScope {
    pub fn new(app: impl Into<String>, services: StreamServices) -> Arc<Self> {
        Arc::new(Self {
            app: app.into(),
            services,
            handler: RwLock::new(None),
        })
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn services(&self) -> &StreamServices {
        &self.services
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn StreamAwareHandler>>) {
        *self.handler.write() = handler;
    }

    pub fn handler(&self) -> Option<Arc<dyn StreamAwareHandler>> {
        self.handler.read().clone()
    }

    /// Run a handler callback if one is installed, logging failures
    pub(crate) fn notify<F>(&self, callback: &'static str, stream: &StreamInfo, f: F)
    where
        F: FnOnce(&dyn StreamAwareHandler, &StreamInfo) -> HandlerResult,
    {
        if let Some(handler) = self.handler() {
            log_failure(callback, stream, f(handler.as_ref(), stream));
        }
    }
}

impl std::fmt::Debug for StreamScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamScope")
            .field("app", &self.app)
            .field("has_handler", &self.handler.read().is_some())
            .finish()
    }
}
