//! HTTP transport
//!
//! Fetches planned batch requests with reqwest on the tokio runtime and hands
//! the bodies back to the loader from [`drive`], which also runs deferred
//! tasks as they come due.

use anyhow::Result;
use reqwest::Client;
use std::cell::Cell;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::module::loader::ModuleLoader;
use crate::module::traits::ModuleState;
use crate::network::{BatchRequest, Transport};

/// Response to one batch request
#[derive(Debug)]
pub struct FetchedBatch {
    pub request: BatchRequest,
    /// Body text, or the transport error
    pub body: Result<String, String>,
}

/// Transport that fetches batch URLs over HTTP
pub struct HttpTransport {
    client: Client,
    runtime: Handle,
    base_url: Option<String>,
    responses: mpsc::UnboundedSender<FetchedBatch>,
    in_flight: Cell<usize>,
}

impl HttpTransport {
    /// Create a transport bound to the current tokio runtime.
    ///
    /// Relative endpoints are joined onto `base_url`.
    pub fn new(
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FetchedBatch>)> {
        let runtime = Handle::try_current()?;
        let client = Client::builder().timeout(timeout).build()?;
        let (responses, receiver) = mpsc::unbounded_channel();
        info!("HTTP transport initialized (timeout {:?})", timeout);
        Ok((
            Self {
                client,
                runtime,
                base_url,
                responses,
                in_flight: Cell::new(0),
            },
            receiver,
        ))
    }

    /// Requests sent whose response has not been handed to [`drive`] yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    fn absolute_url(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if url.starts_with('/') && !url.starts_with("//") => {
                format!("{}{}", base.trim_end_matches('/'), url)
            }
            Some(_) if url.starts_with("//") => format!("https:{}", url),
            _ => url.to_string(),
        }
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: BatchRequest) {
        self.in_flight.set(self.in_flight.get() + 1);
        let client = self.client.clone();
        let url = self.absolute_url(&request.url);
        let responses = self.responses.clone();
        self.runtime.spawn(async move {
            let body = fetch(&client, &url).await.map_err(|e| format!("{:#}", e));
            if responses.send(FetchedBatch { request, body }).is_err() {
                debug!("Dropping response for {}: receiver closed", url);
            }
        });
    }
}

async fn fetch(client: &Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.text().await?)
}

/// Apply one fetched batch to the loader.
///
/// A failed fetch moves the batch's still-loading modules to `error`.
pub fn apply_batch(loader: &ModuleLoader, batch: FetchedBatch) {
    match batch.body {
        Ok(body) => {
            debug!(
                "Received {} bytes for {} modules",
                body.len(),
                batch.request.modules.len()
            );
            if let Err(e) = loader.receive_response(&body) {
                warn!("Malformed response from {}: {}", batch.request.url, e);
            }
        }
        Err(e) => {
            warn!("Batch request to {} failed: {}", batch.request.url, e);
            let stalled: Vec<String> = batch
                .request
                .modules
                .into_iter()
                .filter(|m| loader.get_state(m) == Some(ModuleState::Loading))
                .collect();
            loader.set_state(stalled.into_iter().map(|m| (m, ModuleState::Error)));
        }
    }
}

/// Run the loader until no request is in flight and no task is queued.
pub async fn drive(
    loader: &ModuleLoader,
    transport: &HttpTransport,
    responses: &mut mpsc::UnboundedReceiver<FetchedBatch>,
) {
    loop {
        loader.run_pending_tasks();
        let deadline = loader.next_task_due();
        if transport.in_flight() == 0 && deadline.is_none() {
            break;
        }
        let sleep = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            Some(batch) = responses.recv() => {
                transport.in_flight.set(transport.in_flight.get().saturating_sub(1));
                apply_batch(loader, batch);
            }
            _ = sleep => {}
            else => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use crate::module::host::HeadlessHost;
    use crate::module::registry::Registration;
    use crate::storage::MemoryStore;
    use std::rc::Rc;

    #[tokio::test(flavor = "current_thread")]
    async fn test_absolute_url() {
        let (transport, _rx) =
            HttpTransport::new(Some("https://wiki.example/".into()), Duration::from_secs(1)).unwrap();
        assert_eq!(
            transport.absolute_url("/w/load.php?x=1"),
            "https://wiki.example/w/load.php?x=1"
        );
        assert_eq!(
            transport.absolute_url("//cdn.example/load.php"),
            "https://cdn.example/load.php"
        );
        assert_eq!(
            transport.absolute_url("http://other.example/load.php"),
            "http://other.example/load.php"
        );
    }

    #[test]
    fn test_requires_runtime() {
        assert!(HttpTransport::new(None, Duration::from_secs(1)).is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_failed_fetch_marks_batch_failed() {
        let (transport, mut rx) = HttpTransport::new(
            Some("http://127.0.0.1:9".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let transport = Rc::new(transport);
        let config = LoaderConfig {
            base_modules: Vec::new(),
            ..LoaderConfig::default()
        };
        let loader = ModuleLoader::with_store(
            config,
            Rc::new(HeadlessHost::new()),
            transport.clone(),
            Rc::new(MemoryStore::new()),
        )
        .unwrap();
        loader.register(Registration::new("a").version("1")).unwrap();
        loader.load(&["a"]);
        assert_eq!(transport.in_flight(), 1);

        drive(&loader, &transport, &mut rx).await;
        assert_eq!(transport.in_flight(), 0);
        assert_eq!(loader.get_state("a"), Some(ModuleState::Error));
    }
}
