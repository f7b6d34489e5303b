//! The HTTP endpoint: one `GET` route that answers with the archive.
//!
//! Each request gets its own [`bridge`] and its own blocking producer task, so a slow download
//! never holds up other requests.  Once the `200` and its headers are out, the only way left to
//! report a failure is to abort the connection.  A failing producer makes the body stream yield
//! an error, hyper then drops the connection, and the client ends up with a truncated archive
//! instead of one that looks complete.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures::Stream;
use log::{debug, error, info, warn};

use crate::{
    auth::{AccessGate, CHALLENGE},
    bridge::{self, BridgeReader, BridgeWriter},
    config::ServeConfig,
    encoder::TarEncoder,
    lifecycle::Lifecycle,
    policy::EntryPolicy,
    Error, Result,
};

pub const CONTENT_TYPE: &str = "application/x-tar";
pub const CONTENT_DISPOSITION: &str = "attachment; filename=archive.tar";

/// Shared, read-only state of the endpoint.  The download counter inside [`Lifecycle`] is the
/// only thing requests ever mutate.
#[derive(Debug)]
pub struct AppState {
    gate: AccessGate,
    encoder: Arc<TarEncoder>,
    lifecycle: Arc<Lifecycle>,
}

impl AppState {
    pub fn new(config: &ServeConfig, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            gate: AccessGate::new(config.credentials.clone()),
            encoder: Arc::new(TarEncoder::new(EntryPolicy::from_config(config))),
            lifecycle,
        }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }
}

/// Builds the router serving the archive on `url_path`.  Methods other than `GET` (and the
/// implied `HEAD`) get `405 Method Not Allowed`.
pub fn router(url_path: &str, state: Arc<AppState>) -> Router {
    Router::new()
        .route(url_path, get(serve_archive))
        .with_state(state)
}

async fn serve_archive(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown client".into());
    info!("serving request for {remote}");

    if let Err(failure) = state.gate.check(request.headers()) {
        warn!("rejecting request from {remote}: {failure}");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, CHALLENGE)],
        )
            .into_response();
    }

    let (writer, reader) = bridge::channel();
    let encoder = Arc::clone(&state.encoder);
    tokio::task::spawn_blocking(move || produce(&encoder, writer));

    let body = Body::from_stream(archive_stream(reader, Arc::clone(&state.lifecycle)));
    (
        StatusCode::OK,
        [
            (header::CONTENT_DISPOSITION, CONTENT_DISPOSITION),
            (header::CONTENT_TYPE, CONTENT_TYPE),
        ],
        body,
    )
        .into_response()
}

/// Runs on a blocking thread: encodes the tree into the bridge and signals how it went.
fn produce(encoder: &TarEncoder, mut writer: BridgeWriter) {
    let root = encoder.root().display();

    let signalled = match encoder.encode(&mut writer) {
        Ok(stats) => {
            info!(
                "archived {root}: {} entries, {} skipped, {} bytes of file content",
                stats.entries, stats.skipped, stats.content_bytes
            );
            writer.signal_done()
        }
        Err(Error::Cancelled) => {
            info!("client went away, stopped archiving {root}");
            return;
        }
        Err(err) => {
            error!("archiving {root} failed: {err}");
            writer.signal_error(err)
        }
    };

    if let Err(err) = signalled {
        debug!("could not finish the archive stream for {root}: {err}");
    }
}

/// The response body: chunks from the bridge until the end of the stream, which counts as a
/// completed download.  An error ends the stream with that error.
fn archive_stream(
    reader: BridgeReader,
    lifecycle: Arc<Lifecycle>,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    futures::stream::unfold(Some(reader), move |reader| {
        let lifecycle = Arc::clone(&lifecycle);
        async move {
            let mut reader = reader?;
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => {
                    lifecycle.download_completed();
                    None
                }
                Err(err) => {
                    error!("aborting archive response: {err}");
                    Some((Err(err), None))
                }
            }
        }
    })
}

#[cfg(test)]
mod test {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_archive_stream_counts_completed_downloads() {
        let lifecycle = Arc::new(Lifecycle::new(None));
        let (mut writer, reader) = bridge::channel();
        std::thread::spawn(move || {
            writer.write(Bytes::from_static(b"chunk")).unwrap();
            writer.signal_done().unwrap();
        });

        let chunks: Vec<_> = archive_stream(reader, Arc::clone(&lifecycle))
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap(), &b"chunk"[..]);
        assert_eq!(lifecycle.completed(), 1);
    }

    #[tokio::test]
    async fn test_archive_stream_ends_with_error() {
        let lifecycle = Arc::new(Lifecycle::new(None));
        let (writer, reader) = bridge::channel();
        std::thread::spawn(move || writer.signal_error(Error::Cancelled).unwrap());

        let chunks: Vec<_> = archive_stream(reader, Arc::clone(&lifecycle))
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(Error::Producer(_))));
        assert_eq!(lifecycle.completed(), 0);
    }
}
