//! Socket protocol — event types and inbound validation.
//!
//! DESIGN
//! ======
//! Every socket frame is one JSON object tagged with `type`. Inbound
//! events deserialize into loose request shapes (floats where clients
//! send floats) and pass through `validate` into canonical bodies; a
//! request that fails any rule is dropped with no side effects and no
//! error frame. The same body types cross the broker, so a replicated
//! event re-validates on arrival exactly like a local one.
//!
//! Distributable types (`Dist*`) are the public projections safe to send
//! to end-user clients: the server id alone, and clients without pins.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{self, DecodedImage};

/// Canonical textual uuid length; anything else in a bind request is
/// rejected outright rather than treated as a fresh-bind signal.
pub const UUID_LEN: usize = 36;

/// Display name bounds, inclusive.
pub const NAME_MIN: usize = 1;
pub const NAME_MAX: usize = 16;

/// Maximum chat message length in characters.
pub const CHAT_MAX: usize = 256;

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// INBOUND EVENTS (client -> server)
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEvent {
    Client(BindRequest),
    Paint(PaintRequest),
    Stroke(StrokeRequest),
    Pointer(PointerRequest),
    Chat(ChatRequest),
}

/// Bind or rebind request. The uuid stays a raw string here so that the
/// length-36 rule applies before any parse.
#[derive(Debug, Clone, Deserialize)]
pub struct BindRequest {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub pin: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaintRequest {
    pub layer_number: usize,
    pub x: f64,
    pub y: f64,
    pub mode: PaintMode,
    /// Base64-encoded snapshot blob.
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaintMode {
    Normal,
    Erase,
}

/// Raw stroke points: clients send `[x, y, pressure]` triples, sometimes
/// with trailing junk elements.
#[derive(Debug, Clone, Deserialize)]
pub struct StrokeRequest {
    pub points: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointerRequest {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub time: Option<i64>,
}

// =============================================================================
// CANONICAL BODIES
// =============================================================================
// Validated payloads. These are what fans out to local sockets (with a
// client attached) and what crosses the broker.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaintBody {
    pub layer_number: usize,
    pub mode: PaintMode,
    pub x: u32,
    pub y: u32,
    /// Base64-encoded snapshot blob, forwarded verbatim.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrokeBody {
    pub points: Vec<[u32; 3]>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointerBody {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatBody {
    pub message: String,
    pub time: i64,
}

/// A validated paint event: the canonical body plus its decoded patch,
/// ready to apply.
#[derive(Debug, Clone)]
pub struct ValidPaint {
    pub body: PaintBody,
    pub patch: DecodedImage,
}

/// A validated chat line; the time is stamped by the engine when absent.
#[derive(Debug, Clone)]
pub struct ValidChat {
    pub message: String,
    pub time: Option<i64>,
}

// =============================================================================
// VALIDATION
// =============================================================================

impl PaintRequest {
    /// Validate against the canvas shape and decode the patch.
    #[must_use]
    pub fn validate(&self, layer_count: usize) -> Option<ValidPaint> {
        if !self.x.is_finite() || !self.y.is_finite() || self.x < 0.0 || self.y < 0.0 {
            return None;
        }
        PaintBody {
            layer_number: self.layer_number,
            mode: self.mode,
            x: self.x.floor() as u32,
            y: self.y.floor() as u32,
            data: self.data.clone(),
        }
        .validate(layer_count)
    }
}

impl PaintBody {
    /// Validate a canonical paint body (local or replicated): layer in
    /// range and a well-formed snapshot blob.
    #[must_use]
    pub fn validate(self, layer_count: usize) -> Option<ValidPaint> {
        if self.layer_number >= layer_count {
            return None;
        }
        let bytes = BASE64.decode(&self.data).ok()?;
        let patch = codec::decode(&bytes).ok()?;
        Some(ValidPaint { body: self, patch })
    }
}

impl StrokeRequest {
    /// Validate every point; coordinates round, pressure floors, any
    /// element past the third is dropped.
    #[must_use]
    pub fn validate(&self, width: u32, height: u32) -> Option<StrokeBody> {
        let mut points = Vec::with_capacity(self.points.len());
        for raw in &self.points {
            let [x, y, pressure] = [*raw.first()?, *raw.get(1)?, *raw.get(2)?];
            if !x.is_finite() || !y.is_finite() || !pressure.is_finite() {
                return None;
            }
            if x < 0.0 || y < 0.0 || pressure <= 0.0 {
                return None;
            }
            if x > f64::from(width) || y > f64::from(height) {
                return None;
            }
            points.push([x.round() as u32, y.round() as u32, pressure.floor() as u32]);
        }
        Some(StrokeBody { points })
    }
}

impl PointerRequest {
    /// Validate a pointer position; `-1` is the off-canvas sentinel.
    #[must_use]
    pub fn validate(&self, width: u32, height: u32) -> Option<PointerBody> {
        if !self.x.is_finite() || !self.y.is_finite() {
            return None;
        }
        let x = self.x.floor();
        let y = self.y.floor();
        if x < -1.0 || y < -1.0 || x > f64::from(width) || y > f64::from(height) {
            return None;
        }
        Some(PointerBody { x: x as i64, y: y as i64 })
    }
}

impl ChatRequest {
    /// Validate a chat line: non-empty, non-whitespace, at most
    /// [`CHAT_MAX`] characters.
    #[must_use]
    pub fn validate(&self) -> Option<ValidChat> {
        if self.message.trim().is_empty() || self.message.chars().count() > CHAT_MAX {
            return None;
        }
        Some(ValidChat { message: self.message.clone(), time: self.time })
    }
}

// =============================================================================
// DISTRIBUTABLE PROJECTIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistServer {
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistClient {
    pub uuid: Uuid,
    pub name: String,
    pub server_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistConfig {
    pub title: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub layer_count: usize,
    pub version: VersionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub server: String,
    pub client: String,
}

// =============================================================================
// OUTBOUND EVENTS (server -> client)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    Server(DistServer),
    Config(DistConfig),
    /// Bind credentials, sent to the binder only.
    Client(ClientCredentials),
    Clients { clients: Vec<DistClient> },
    Chat(ChatBroadcast),
    Paint(PaintBroadcast),
    /// Acknowledgement to the paint originator only.
    Painted,
    Stroke(StrokeBroadcast),
    Pointer(PointerBroadcast),
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientCredentials {
    pub uuid: Uuid,
    pub name: String,
    pub pin: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatBroadcast {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<DistClient>,
    pub message: String,
    pub time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaintBroadcast {
    pub client: DistClient,
    #[serde(flatten)]
    pub body: PaintBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrokeBroadcast {
    pub client: DistClient,
    #[serde(flatten)]
    pub body: StrokeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct PointerBroadcast {
    pub client: DistClient,
    #[serde(flatten)]
    pub body: PointerBody,
}

#[cfg(test)]
#[path = "protocol_test.rs"]
mod tests;
