//! The carrier's media WebSocket framing protocol.
//!
//! Newline-delimited JSON envelopes, discriminated by `event`:
//!
//! 1. `connected` — protocol preamble
//! 2. `start` — stream metadata (callSid, accountSid, from/to, format)
//! 3. `media` — repeated; 160 bytes of base64 µ-law per message
//! 4. `dtmf` — optional keypad digits
//! 5. `stop` — terminal
//!
//! Outbound reuses the same envelope: `media` with a `streamSid` echo,
//! `mark` to detect flush completion, `clear` to flush the far-side
//! jitter buffer on barge-in, and `transfer` to redirect the call.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum CarrierMessage {
    Connected {
        protocol: String,
        version: String,
    },
    Start {
        start: StartMeta,
    },
    Media {
        #[serde(skip_serializing_if = "Option::is_none", rename = "streamSid")]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Dtmf {
        dtmf: DtmfPayload,
    },
    Stop {
        stop: StopMeta,
    },
    Mark {
        #[serde(skip_serializing_if = "Option::is_none", rename = "streamSid")]
        stream_sid: Option<String>,
        mark: MarkPayload,
    },
    Clear {
        #[serde(skip_serializing_if = "Option::is_none", rename = "streamSid")]
        stream_sid: Option<String>,
    },
    Transfer {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        transfer: TransferPayload,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    pub stream_sid: String,
    pub call_sid: String,
    pub account_sid: String,
    #[serde(default)]
    pub tracks: Vec<String>,
    pub media_format: MediaFormat,
    #[serde(default)]
    pub custom_parameters: CustomParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomParameters {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    /// Monotonic sequence number, transmitted as a decimal string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    /// Milliseconds since stream start, transmitted as a decimal string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Base64 µ-law audio.
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtmfPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    pub digit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopMeta {
    pub account_sid: String,
    pub call_sid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPayload {
    pub to: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CarrierMessage {
    /// Outbound audio envelope.
    pub fn outbound_media(stream_sid: &str, payload_b64: String) -> Self {
        CarrierMessage::Media {
            stream_sid: Some(stream_sid.to_owned()),
            media: MediaPayload {
                track: None,
                chunk: None,
                timestamp: None,
                payload: payload_b64,
            },
        }
    }

    pub fn outbound_mark(stream_sid: &str, name: &str) -> Self {
        CarrierMessage::Mark {
            stream_sid: Some(stream_sid.to_owned()),
            mark: MarkPayload { name: name.to_owned() },
        }
    }

    pub fn outbound_clear(stream_sid: &str) -> Self {
        CarrierMessage::Clear {
            stream_sid: Some(stream_sid.to_owned()),
        }
    }

    pub fn outbound_transfer(stream_sid: &str, to: &str, reason: Option<&str>) -> Self {
        CarrierMessage::Transfer {
            stream_sid: stream_sid.to_owned(),
            transfer: TransferPayload {
                to: to.to_owned(),
                reason: reason.map(str::to_owned),
            },
        }
    }
}
