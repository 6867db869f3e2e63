use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::ContentType;

/// Cadence of the free-slot probe while images are believed in flight.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// Probe/upload failures tolerated before the display counts as gone.
pub const UNREACHABLE_THRESHOLD: u32 = 3;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// The display's view of its own upload queue.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct SlotStatus {
    pub free: u32,
    pub capacity: u32,
}

/// Outcome of handing one image to the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The bytes reached the display's queue.
    Accepted,
    /// The device refused for lack of a slot (503); retry when one frees.
    Busy,
    /// The device refused the file itself (too large or unparseable);
    /// never offer this image again.
    Rejected,
}

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("display unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected display response: HTTP {0}")]
    UnexpectedStatus(u16),
}

/// Seam for the HTTP layer; tests substitute a scripted device.
#[async_trait]
pub trait DisplayBackend: Send + Sync {
    async fn post(
        &self,
        url: &Url,
        body: Vec<u8>,
        content_type: &'static str,
    ) -> Result<u16, DisplayError>;

    async fn get(&self, url: &Url) -> Result<(u16, String), DisplayError>;
}

pub struct ReqwestDisplayBackend {
    client: reqwest::Client,
}

impl ReqwestDisplayBackend {
    pub fn new() -> Result<Self, DisplayError> {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|err| DisplayError::Unreachable(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DisplayBackend for ReqwestDisplayBackend {
    async fn post(
        &self,
        url: &Url,
        body: Vec<u8>,
        content_type: &'static str,
    ) -> Result<u16, DisplayError> {
        let response = self
            .client
            .post(url.clone())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|err| DisplayError::Unreachable(err.to_string()))?;
        Ok(response.status().as_u16())
    }

    async fn get(&self, url: &Url) -> Result<(u16, String), DisplayError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| DisplayError::Unreachable(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| DisplayError::Unreachable(err.to_string()))?;
        Ok((status, body))
    }
}

/// HTTP client for the matrix display. Stateless: the slot mirror and
/// health tracking live with the controller, which owns all shared state.
pub struct DisplayClient {
    base: Url,
    backend: Arc<dyn DisplayBackend>,
}

impl DisplayClient {
    pub fn new(hostname: &str, backend: Arc<dyn DisplayBackend>) -> Result<Self, DisplayError> {
        let base = Url::parse(&format!("http://{}/", hostname.trim()))
            .map_err(|err| DisplayError::Unreachable(format!("bad display hostname: {err}")))?;
        Ok(Self { base, backend })
    }

    /// Upload one image. `prio` bypasses the device's queue order.
    pub async fn send_image(
        &self,
        bytes: Vec<u8>,
        content_type: ContentType,
        prio: bool,
    ) -> Result<SendOutcome, DisplayError> {
        let path = if prio { "image-prio" } else { "image" };
        let url = self.endpoint(path);
        let status = self.backend.post(&url, bytes, content_type.as_str()).await?;
        match status {
            200..=299 => Ok(SendOutcome::Accepted),
            503 => {
                debug!("display memory full");
                Ok(SendOutcome::Busy)
            }
            413 | 422 => {
                info!(status, "display rejected image file");
                Ok(SendOutcome::Rejected)
            }
            status @ (408 | 500..=599) => Err(DisplayError::Unreachable(format!(
                "upload failed with HTTP {status}"
            ))),
            status => Err(DisplayError::UnexpectedStatus(status)),
        }
    }

    /// Ask the device how many slots are free. The response is the only
    /// source of truth for the slot mirror.
    pub async fn probe(&self) -> Result<SlotStatus, DisplayError> {
        let url = self.endpoint("free-slots");
        let (status, body) = self.backend.get(&url).await?;
        if !(200..=299).contains(&status) {
            return Err(DisplayError::Unreachable(format!(
                "status probe failed with HTTP {status}"
            )));
        }
        serde_json::from_str(&body)
            .map_err(|err| DisplayError::Unreachable(format!("bad status document: {err}")))
    }

    /// Blank the display and empty its queue.
    pub async fn clear(&self) -> Result<(), DisplayError> {
        let url = self.endpoint("clear");
        let (status, body) = self.backend.get(&url).await?;
        match status {
            200..=299 => {
                info!("display cleared");
                Ok(())
            }
            500 => Err(DisplayError::Unreachable(format!(
                "display clear failed: {body}"
            ))),
            status => Err(DisplayError::UnexpectedStatus(status)),
        }
    }

    fn endpoint(&self, path: &str) -> Url {
        self.base
            .join(path)
            .expect("static endpoint path joins cleanly")
    }
}

/// Local mirror of the display's slot queue. `capacity == 0` means the
/// capacity has not been learned yet and every token belongs in the backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotMirror {
    capacity: u32,
    in_flight: u32,
}

impl SlotMirror {
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    pub fn free_slots(&self) -> u32 {
        self.capacity - self.in_flight
    }

    /// Overwrite the mirror with a probe result.
    pub fn apply_status(&mut self, status: SlotStatus) {
        let free = status.free.min(status.capacity);
        self.capacity = status.capacity;
        self.in_flight = status.capacity - free;
    }

    /// Account for one accepted upload.
    pub fn record_upload(&mut self) {
        self.in_flight = (self.in_flight + 1).min(self.capacity);
    }

    /// The device queue was emptied.
    pub fn record_clear(&mut self) {
        self.in_flight = 0;
    }
}

/// Consecutive-failure health tracking for the display link.
#[derive(Debug, Default)]
pub struct DisplayHealth {
    consecutive_failures: u32,
    unreachable: bool,
}

impl DisplayHealth {
    pub fn is_reachable(&self) -> bool {
        !self.unreachable
    }

    /// Record a failed probe or upload. Returns true when this failure
    /// transitions the link to unreachable.
    pub fn record_failure(&mut self, what: &str, err: &DisplayError) -> bool {
        self.consecutive_failures += 1;
        warn!(error = %err, failures = self.consecutive_failures, "display {what} failed");
        if !self.unreachable && self.consecutive_failures >= UNREACHABLE_THRESHOLD {
            self.unreachable = true;
            warn!("display is unreachable, holding uploads");
            return true;
        }
        false
    }

    /// Record a successful probe or upload. Returns true when this success
    /// recovers the link.
    pub fn record_success(&mut self) -> bool {
        self.consecutive_failures = 0;
        if self.unreachable {
            self.unreachable = false;
            info!("display reachable again");
            return true;
        }
        false
    }
}
