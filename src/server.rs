//! Binding the listener and running the endpoint until the lifecycle asks for shutdown.

use std::{net::SocketAddr, sync::Arc};

use axum::Router;
use log::info;
use tokio::net::TcpListener;

use crate::{
    config::ServeConfig,
    handler::{router, AppState},
    lifecycle::Lifecycle,
    Result,
};

#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    app: Router,
    lifecycle: Arc<Lifecycle>,
}

impl Server {
    /// Binds to the configured address.
    pub async fn bind(config: &ServeConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.listen.as_str(), config.port)).await?;
        Ok(Self::from_listener(listener, config))
    }

    pub fn from_listener(listener: TcpListener, config: &ServeConfig) -> Self {
        let lifecycle = Arc::new(Lifecycle::new(config.quit_after));
        let state = Arc::new(AppState::new(config, Arc::clone(&lifecycle)));
        Self {
            listener,
            app: router(&config.url_path, state),
            lifecycle,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Serves until [`Lifecycle`] requests shutdown, then stops accepting connections and
    /// returns once the responses in flight have finished.
    pub async fn run(self) -> Result<()> {
        info!("listening on {}", self.local_addr()?);

        let shutdown = self.lifecycle.shutdown_requested();
        axum::serve(
            self.listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!(
            "server stopped after {} completed download(s)",
            self.lifecycle.completed()
        );
        Ok(())
    }
}
