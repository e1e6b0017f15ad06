//! One-shot provider-catalog retrieval.
//!
//! The server pushes its catalog on every accept and answers explicit
//! `lists` requests. This module opens a short-lived [`Session`], asks,
//! waits for the first `provider_lists` message, and closes. The channel
//! is never kept open speculatively.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::protocol::{ClientRequest, ProviderList, ServerMessage};
use crate::session::{Disconnect, Session, SessionEvents};
use crate::transport::{Connector, CLOSE_NORMAL};
use crate::{AppError, Result};

/// Settles the fetch with the first catalog (or the first failure).
struct CatalogListener {
    waiter: Mutex<Option<oneshot::Sender<Result<BTreeMap<String, ProviderList>>>>>,
}

impl CatalogListener {
    fn settle(&self, outcome: Result<BTreeMap<String, ProviderList>>) {
        let waiter = self
            .waiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
    }
}

impl SessionEvents for CatalogListener {
    fn on_message(&self, message: ServerMessage) {
        if let ServerMessage::ProviderLists { lists } = message {
            debug!(lists = lists.len(), "provider catalog received");
            self.settle(Ok(lists));
        }
    }

    fn on_error(&self, disconnect: Disconnect) {
        let error = if disconnect.was_connected {
            AppError::ConnectionClosed(disconnect.detail)
        } else {
            AppError::Connection(disconnect.detail)
        };
        self.settle(Err(error));
    }

    fn on_close(&self, disconnect: Disconnect) {
        self.settle(Err(AppError::ConnectionClosed(disconnect.detail)));
    }
}

/// Fetch the server's provider-list catalog.
///
/// # Errors
///
/// - [`AppError::Connection`] — the channel never opened.
/// - [`AppError::ConnectionClosed`] — the channel closed (or `wait`
///   elapsed) before a catalog arrived.
/// - [`AppError::NotOpen`] — the channel dropped between opening and the
///   request going out.
pub async fn fetch_provider_lists(
    connector: Arc<dyn Connector>,
    url: &str,
    wait: Duration,
) -> Result<BTreeMap<String, ProviderList>> {
    let (tx, rx) = oneshot::channel();
    let listener = Arc::new(CatalogListener {
        waiter: Mutex::new(Some(tx)),
    });
    let session = Session::new(connector, url, listener);

    session.ensure_open().await?;
    session.send(&ClientRequest::Lists)?;

    let outcome = tokio::time::timeout(wait, rx).await;
    session.close(CLOSE_NORMAL, "provider lists received");

    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(AppError::ConnectionClosed(
            "catalog fetch abandoned".into(),
        )),
        Err(_) => Err(AppError::ConnectionClosed(
            "timed out waiting for provider lists".into(),
        )),
    }
}
