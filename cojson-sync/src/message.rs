//! Peer wire messages
//!
//! Newline-delimited JSON over any ordered reliable byte stream. Each
//! frame is one message, tagged by its `action` field. The payload
//! reuses the core's canonical encodings, so frames are byte-stable
//! across implementations.

use cojson_core::{CoHeader, SessionNewContent};
use cojson_model::{CoId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from decoding a wire frame
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid frame: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("frame contains a newline")]
    EmbeddedNewline,
}

/// One message on the duplex channel with a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncMessage {
    /// "I have these sessions up to these indices."
    Known {
        id: CoId,
        header: bool,
        sessions: BTreeMap<SessionId, u32>,
    },
    /// Transactions extending the receiver's known state.
    Content {
        id: CoId,
        #[serde(skip_serializing_if = "Option::is_none")]
        header: Option<CoHeader>,
        new: BTreeMap<SessionId, SessionNewContent>,
    },
    /// "Please send anything beyond this."
    Load {
        id: CoId,
        sessions: BTreeMap<SessionId, u32>,
    },
    /// "I have no more to send right now."
    Done { id: CoId },
}

impl SyncMessage {
    /// The CoValue this message concerns.
    pub fn co_id(&self) -> &CoId {
        match self {
            SyncMessage::Known { id, .. }
            | SyncMessage::Content { id, .. }
            | SyncMessage::Load { id, .. }
            | SyncMessage::Done { id } => id,
        }
    }

    /// Encode one newline-terminated frame.
    pub fn encode_frame(&self) -> Result<String, FrameError> {
        let mut line = serde_json::to_string(self)?;
        // JSON strings escape control characters, so this only trips on
        // a serializer bug.
        if line.contains('\n') {
            return Err(FrameError::EmbeddedNewline);
        }
        line.push('\n');
        Ok(line)
    }

    /// Decode one frame (with or without its trailing newline).
    pub fn decode_frame(line: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(line.trim_end_matches('\n'))?)
    }
}

/// Split a receive buffer into complete frames, leaving any partial
/// trailing line in place.
pub fn drain_frames(buffer: &mut String) -> Result<Vec<SyncMessage>, FrameError> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            frames.push(SyncMessage::decode_frame(trimmed)?);
        }
    }
    Ok(frames)
}
