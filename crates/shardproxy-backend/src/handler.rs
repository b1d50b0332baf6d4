//! Channel lifecycle hooks
//!
//! A pool is constructed with one [`ChannelPoolHandler`] and calls it at each
//! channel transition. `channel_created` runs once per physical connection,
//! before the channel is handed to anyone: it first runs the login bound to
//! the channel's datasource, then attaches frame-level diagnostics.
//! Acquire and release notifications are observational and cannot fail.

use crate::channel::BackendChannel;
use crate::datasource::DataSourceConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Hooks invoked by a channel pool at each channel transition
#[async_trait]
pub trait ChannelPoolHandler: Send + Sync + fmt::Debug {
    /// A physical connection was established; make it usable.
    ///
    /// An error discards the channel.
    async fn channel_created(&self, channel: &mut BackendChannel) -> Result<()>;

    /// A channel was handed to a caller
    fn channel_acquired(&self, _channel: &BackendChannel) {}

    /// A channel went back to the idle set
    fn channel_released(&self, _channel: &BackendChannel) {}

    /// A channel was closed instead of being pooled
    fn channel_discarded(&self, _channel: &BackendChannel, _reason: &str) {}
}

/// Builds the handler for a datasource's pool
pub type HandlerFactory =
    Arc<dyn Fn(Arc<DataSourceConfig>) -> Arc<dyn ChannelPoolHandler> + Send + Sync>;

/// Factory producing [`BackendChannelHandler`]s
pub fn default_handler_factory() -> HandlerFactory {
    Arc::new(|datasource| Arc::new(BackendChannelHandler::new(datasource)))
}

/// Standard handler: login with the datasource's credentials, then frame tracing
#[derive(Debug, Clone)]
pub struct BackendChannelHandler {
    datasource: Arc<DataSourceConfig>,
}

impl BackendChannelHandler {
    /// Bind a handler to a datasource
    pub fn new(datasource: Arc<DataSourceConfig>) -> Self {
        Self { datasource }
    }

    /// Datasource this handler initializes channels for
    pub fn datasource(&self) -> &Arc<DataSourceConfig> {
        &self.datasource
    }
}

#[async_trait]
impl ChannelPoolHandler for BackendChannelHandler {
    async fn channel_created(&self, channel: &mut BackendChannel) -> Result<()> {
        if channel.datasource().name != self.datasource.name {
            return Err(Error::config(format!(
                "channel for '{}' offered to the pool of '{}'",
                channel.datasource().name,
                self.datasource.name
            )));
        }

        channel.handshake().await?;
        channel.enable_frame_logging();

        info!(
            channel = %channel.id(),
            datasource = %self.datasource.name,
            server_version = channel.server_version().unwrap_or("unknown"),
            "channel created"
        );
        Ok(())
    }

    fn channel_acquired(&self, channel: &BackendChannel) {
        debug!(channel = %channel.id(), datasource = %self.datasource.name, "channel acquired");
    }

    fn channel_released(&self, channel: &BackendChannel) {
        debug!(channel = %channel.id(), datasource = %self.datasource.name, "channel released");
    }

    fn channel_discarded(&self, channel: &BackendChannel, reason: &str) {
        debug!(
            channel = %channel.id(),
            datasource = %self.datasource.name,
            reason,
            "channel discarded"
        );
    }
}
