//! Async driver task and the public session facade.
//!
//! The engine itself is synchronous and single-threaded. [`Session::spawn`]
//! wraps it in a task that serializes the three input streams (requests
//! from callers, events from the transport, fired deadlines) so the engine
//! sees them strictly one at a time, in arrival order. Callers get plain
//! async methods and never touch the engine directly.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::debug;

use crate::link::{
    DeadlineToken, DiscoveredTag, LinkEngine, LinkError, LinkRequest, LinkResult, SummaryEvent,
    TagIdentity, Target, Transport, TransportEvent,
};

/// Handle to a running link driver.
///
/// Cheap to clone; all handles feed the same single-session engine, so a
/// request submitted while another is in flight supersedes it.
#[derive(Debug, Clone)]
pub struct Session {
    requests: mpsc::UnboundedSender<LinkRequest>,
}

impl Session {
    /// Spawn the driver task around a transport.
    ///
    /// `events` carries every callback from the platform BLE stack. The
    /// driver owns both receivers; dropping all `Session` handles and the
    /// event sender stops it.
    pub fn spawn<T>(transport: T, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self
    where
        T: Transport + Send + 'static,
    {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(LinkEngine::new(transport), requests_rx, events));
        Session { requests }
    }

    /// Collect advertising tags until the scan window closes.
    pub async fn scan(&self) -> LinkResult<Vec<DiscoveredTag>> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(LinkRequest::Scan { reply }, rx).await
    }

    /// Pull and decode the tag's summary event log.
    pub async fn fetch_summary(&self, target: Target) -> LinkResult<Vec<SummaryEvent>> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(LinkRequest::FetchSummary { target, reply }, rx)
            .await
    }

    /// Read the tag's identity block.
    pub async fn read_identity(&self, target: Target) -> LinkResult<TagIdentity> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(LinkRequest::ReadIdentity { target, reply }, rx)
            .await
    }

    /// Set the tag's clock to `when`.
    pub async fn set_time(&self, target: Target, when: DateTime<Utc>) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.roundtrip(LinkRequest::SetTime { target, when, reply }, rx)
            .await
    }

    /// Set the tag's clock to the current wall time.
    pub async fn set_time_now(&self, target: Target) -> LinkResult<()> {
        self.set_time(target, Utc::now()).await
    }

    async fn roundtrip<R>(
        &self,
        request: LinkRequest,
        rx: oneshot::Receiver<LinkResult<R>>,
    ) -> LinkResult<R> {
        self.requests
            .send(request)
            .map_err(|_| LinkError::SessionClosed)?;
        rx.await.map_err(|_| LinkError::SessionClosed)?
    }
}

/// Serialize the three input streams into single engine calls.
///
/// Deadlines are ordinary sleeps that post their token back into the
/// loop; the engine decides whether a fired token still means anything.
async fn drive<T: Transport>(
    mut engine: LinkEngine<T>,
    mut requests: mpsc::UnboundedReceiver<LinkRequest>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let (deadline_tx, mut deadlines) = mpsc::unbounded_channel::<DeadlineToken>();

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => engine.submit(request),
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => engine.handle_transport(event),
                None => break,
            },
            Some(token) = deadlines.recv() => engine.handle_deadline(token),
        }

        if let Some(timer) = engine.take_timer() {
            let deadline_tx = deadline_tx.clone();
            tokio::spawn(async move {
                sleep(timer.after).await;
                let _ = deadline_tx.send(timer.token);
            });
        }
    }

    debug!(state = engine.state_name(), "link driver stopping");
    engine.shutdown();
}
