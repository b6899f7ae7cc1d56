use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use ulid::Ulid;

use crate::http::{BookingConfirmed, ConfirmRequest, ErrorResponse, HOLDER_TOKEN_HEADER, SlotRef};
use crate::limits::MAX_EVENT_LINE_BYTES;
use crate::model::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default reconnect backoff after the stream or a fetch fails.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);

/// Default rolling snapshot horizon, in days.
pub const DEFAULT_DAYS: u32 = 7;

// ── Errors ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The coordinator refused the transition.
    Rejected { code: String, message: String },
    /// The request or stream failed before an answer arrived.
    Transport(String),
    /// A confirm was requested while no slot is selected.
    NoSelection,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Rejected { code, message } => write!(f, "rejected ({code}): {message}"),
            SyncError::Transport(e) => write!(f, "transport failure: {e}"),
            SyncError::NoSelection => write!(f, "no slot is selected"),
        }
    }
}

impl std::error::Error for SyncError {}

// ── Transport ────────────────────────────────────────────

pub type EventStream = Pin<Box<dyn Stream<Item = Result<SlotEvent, SyncError>> + Send>>;

/// Wire operations the synchronizer needs. Swapped out in tests.
#[async_trait]
pub trait SlotTransport: Send + Sync {
    async fn fetch_snapshot(
        &self,
        resource_id: Ulid,
        days: u32,
    ) -> Result<CalendarSnapshot, SyncError>;

    async fn subscribe(&self, resource_id: Ulid) -> Result<EventStream, SyncError>;

    async fn reserve(
        &self,
        resource_id: Ulid,
        datetime: Stamp,
        token: &HolderToken,
    ) -> Result<(), SyncError>;

    async fn release(
        &self,
        resource_id: Ulid,
        datetime: Stamp,
        token: &HolderToken,
    ) -> Result<(), SyncError>;

    async fn confirm(
        &self,
        resource_id: Ulid,
        datetime: Stamp,
        token: &HolderToken,
        booking: serde_json::Value,
    ) -> Result<Ulid, SyncError>;
}

/// Talks to a holdfast server over HTTP plus the NDJSON event stream.
pub struct HttpTransport {
    base: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        // No client-wide timeout: it would also cut off the long-lived
        // stream request. Unary calls set their own deadline instead.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let base: String = base_url.into();
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn rejection(response: reqwest::Response) -> SyncError {
        let status = response.status();
        match response.json::<ErrorResponse>().await {
            Ok(body) => SyncError::Rejected {
                code: body.error.code,
                message: body.error.message,
            },
            Err(_) => SyncError::Transport(format!("unexpected status {status}")),
        }
    }
}

#[async_trait]
impl SlotTransport for HttpTransport {
    async fn fetch_snapshot(
        &self,
        resource_id: Ulid,
        days: u32,
    ) -> Result<CalendarSnapshot, SyncError> {
        let url = format!("{}/slots?resourceId={resource_id}&days={days}", self.base);
        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    async fn subscribe(&self, resource_id: Ulid) -> Result<EventStream, SyncError> {
        let url = format!("{}/slots/stream?resourceId={resource_id}", self.base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_EVENT_LINE_BYTES),
        );
        let events = lines.filter_map(|line| match line {
            // Blank lines are keepalives
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(
                serde_json::from_str::<SlotEvent>(&line)
                    .map_err(|e| SyncError::Transport(e.to_string())),
            ),
            Err(e) => Some(Err(SyncError::Transport(e.to_string()))),
        });
        Ok(Box::pin(events))
    }

    async fn reserve(
        &self,
        resource_id: Ulid,
        datetime: Stamp,
        token: &HolderToken,
    ) -> Result<(), SyncError> {
        let url = format!("{}/slots/reserve", self.base);
        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .header(HOLDER_TOKEN_HEADER, token.as_str())
            .json(&SlotRef {
                resource_id,
                datetime,
            })
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(())
    }

    async fn release(
        &self,
        resource_id: Ulid,
        datetime: Stamp,
        token: &HolderToken,
    ) -> Result<(), SyncError> {
        let url = format!("{}/slots/release", self.base);
        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .header(HOLDER_TOKEN_HEADER, token.as_str())
            .json(&SlotRef {
                resource_id,
                datetime,
            })
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(())
    }

    async fn confirm(
        &self,
        resource_id: Ulid,
        datetime: Stamp,
        token: &HolderToken,
        booking: serde_json::Value,
    ) -> Result<Ulid, SyncError> {
        let url = format!("{}/slots/confirm", self.base);
        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .header(HOLDER_TOKEN_HEADER, token.as_str())
            .json(&ConfirmRequest {
                resource_id,
                datetime,
                booking_payload: booking,
            })
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        let confirmed: BookingConfirmed = response
            .json()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(confirmed.booking_id)
    }
}

// ── View ─────────────────────────────────────────────────

/// What the portal renders: authoritative slot states merged with this
/// client's own optimistic selection.
#[derive(Debug, Clone, Default)]
pub struct SlotView {
    pub slots: BTreeMap<Stamp, SlotState>,
    /// The slot this client currently holds, if any.
    pub selected: Option<Stamp>,
    /// Set when the held slot was booked away by another path.
    pub displaced: bool,
    pub last_sync: Option<Stamp>,
}

// ── Synchronizer ─────────────────────────────────────────

struct Shared {
    transport: Arc<dyn SlotTransport>,
    resource_id: Ulid,
    token: HolderToken,
    days: u32,
    backoff: Duration,
    view: watch::Sender<SlotView>,
}

impl Shared {
    async fn refetch(&self) -> Result<(), SyncError> {
        let snapshot = self
            .transport
            .fetch_snapshot(self.resource_id, self.days)
            .await?;
        self.view.send_modify(|view| {
            view.slots = snapshot.slots;
            view.last_sync = Some(snapshot.generated_at);
            if let Some(selected) = view.selected {
                if view.slots.get(&selected) == Some(&SlotState::Booked) {
                    // Booked is authoritative, even against our own hold
                    view.selected = None;
                    view.displaced = true;
                } else {
                    // Our optimistic hold outranks held/available churn
                    view.slots.insert(selected, SlotState::Held);
                }
            }
        });
        Ok(())
    }

    /// Folds one streamed event into the view. Returns true when the
    /// caller must refetch the whole snapshot.
    fn apply_event(&self, event: &SlotEvent) -> bool {
        if event.resource_id != self.resource_id {
            return false;
        }
        let Some(datetime) = event.datetime else {
            return event.kind == SlotEventKind::CalendarUpdated;
        };
        if event.kind == SlotEventKind::CalendarUpdated {
            return true;
        }
        self.view.send_modify(|view| {
            let own = view.selected == Some(datetime);
            match event.kind {
                SlotEventKind::Booked => {
                    view.slots.insert(datetime, SlotState::Booked);
                    if own {
                        // Someone else won this slot; our hold is void
                        view.selected = None;
                        view.displaced = true;
                    }
                }
                SlotEventKind::Held if !own => {
                    view.slots.insert(datetime, SlotState::Held);
                }
                SlotEventKind::Released if !own => {
                    view.slots.insert(datetime, SlotState::Available);
                }
                // Echoes of our own hold churn; the view already shows it
                SlotEventKind::Held | SlotEventKind::Released => {}
                SlotEventKind::CalendarUpdated => {}
            }
        });
        false
    }
}

/// Keeps one client's calendar view live for a single resource: initial
/// fetch, event stream, reconnect with backoff, and the hold lifecycle.
pub struct Synchronizer {
    shared: Arc<Shared>,
    view_rx: watch::Receiver<SlotView>,
    pump: JoinHandle<()>,
}

impl Synchronizer {
    pub fn attach(transport: Arc<dyn SlotTransport>, resource_id: Ulid, token: HolderToken) -> Self {
        Self::attach_with(transport, resource_id, token, DEFAULT_DAYS, DEFAULT_BACKOFF)
    }

    pub fn attach_with(
        transport: Arc<dyn SlotTransport>,
        resource_id: Ulid,
        token: HolderToken,
        days: u32,
        backoff: Duration,
    ) -> Self {
        let (view_tx, view_rx) = watch::channel(SlotView::default());
        let shared = Arc::new(Shared {
            transport,
            resource_id,
            token,
            days,
            backoff,
            view: view_tx,
        });
        let pump = tokio::spawn(run_pump(shared.clone()));
        Self {
            shared,
            view_rx,
            pump,
        }
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> SlotView {
        self.view_rx.borrow().clone()
    }

    /// Resolves once the view has changed since the last call.
    pub async fn changed(&mut self) -> Result<(), SyncError> {
        self.view_rx
            .changed()
            .await
            .map_err(|_| SyncError::Transport("synchronizer stopped".into()))
    }

    /// Takes a hold on `datetime`, swapping out any previous selection.
    pub async fn reserve(&self, datetime: Stamp) -> Result<(), SyncError> {
        let previous = self.view_rx.borrow().selected;
        if previous == Some(datetime) {
            return Ok(());
        }
        if let Some(previous) = previous {
            let _ = self
                .shared
                .transport
                .release(self.shared.resource_id, previous, &self.shared.token)
                .await;
            self.shared.view.send_modify(|view| {
                view.selected = None;
                view.slots.insert(previous, SlotState::Available);
            });
        }
        match self
            .shared
            .transport
            .reserve(self.shared.resource_id, datetime, &self.shared.token)
            .await
        {
            Ok(()) => {
                self.shared.view.send_modify(|view| {
                    view.selected = Some(datetime);
                    view.displaced = false;
                    view.slots.insert(datetime, SlotState::Held);
                });
                Ok(())
            }
            Err(e @ SyncError::Rejected { .. }) => {
                // Lost the race; show the truth so the user picks again
                let _ = self.shared.refetch().await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Gives the held slot back. Succeeds when nothing is held.
    pub async fn release(&self) -> Result<(), SyncError> {
        let Some(selected) = self.view_rx.borrow().selected else {
            return Ok(());
        };
        match self
            .shared
            .transport
            .release(self.shared.resource_id, selected, &self.shared.token)
            .await
        {
            Ok(()) => {
                self.shared.view.send_modify(|view| {
                    view.selected = None;
                    view.slots.insert(selected, SlotState::Available);
                });
                Ok(())
            }
            Err(SyncError::Rejected { .. }) => {
                // The hold is already gone server-side; resync and move on
                self.shared.view.send_modify(|view| view.selected = None);
                let _ = self.shared.refetch().await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Books the held slot. On rejection the local selection is cleared
    /// and the snapshot refreshed, since our ownership belief was stale.
    pub async fn confirm(&self, booking: serde_json::Value) -> Result<Ulid, SyncError> {
        let Some(selected) = self.view_rx.borrow().selected else {
            return Err(SyncError::NoSelection);
        };
        match self
            .shared
            .transport
            .confirm(self.shared.resource_id, selected, &self.shared.token, booking)
            .await
        {
            Ok(booking_id) => {
                self.shared.view.send_modify(|view| {
                    view.selected = None;
                    view.displaced = false;
                    view.slots.insert(selected, SlotState::Booked);
                });
                Ok(booking_id)
            }
            Err(e @ SyncError::Rejected { .. }) => {
                self.shared.view.send_modify(|view| view.selected = None);
                let _ = self.shared.refetch().await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Stops the pump and releases any held slot before going away.
    pub async fn detach(self) {
        self.pump.abort();
        let selected = self.view_rx.borrow().selected;
        if let Some(selected) = selected {
            if let Err(e) = self
                .shared
                .transport
                .release(self.shared.resource_id, selected, &self.shared.token)
                .await
            {
                tracing::debug!("release on detach failed: {e}");
            }
        }
        self.shared.view.send_modify(|view| view.selected = None);
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.pump.abort();
        // Last-resort release when dropped without detach. The server's
        // lease sweep is the backstop if no runtime is available here.
        let selected = self.view_rx.borrow().selected;
        if let Some(selected) = selected
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            let shared = self.shared.clone();
            handle.spawn(async move {
                let _ = shared
                    .transport
                    .release(shared.resource_id, selected, &shared.token)
                    .await;
            });
        }
    }
}

async fn run_pump(shared: Arc<Shared>) {
    loop {
        if let Err(e) = shared.refetch().await {
            tracing::debug!("snapshot fetch failed: {e}");
            tokio::time::sleep(shared.backoff).await;
            continue;
        }
        let mut events = match shared.transport.subscribe(shared.resource_id).await {
            Ok(events) => events,
            Err(e) => {
                tracing::debug!("subscribe failed: {e}");
                tokio::time::sleep(shared.backoff).await;
                continue;
            }
        };
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    if shared.apply_event(&event)
                        && let Err(e) = shared.refetch().await
                    {
                        tracing::debug!("refetch after calendar_updated failed: {e}");
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("event stream error: {e}");
                    break;
                }
            }
        }
        // Stream gone; events may have been missed, so the next pass
        // starts with a reconciliation fetch.
        tokio::time::sleep(shared.backoff).await;
    }
}
