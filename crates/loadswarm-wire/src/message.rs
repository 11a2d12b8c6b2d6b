//! Wire message envelope, payloads, and framing.
//!
//! A frame is a 4-byte big-endian length header followed by the JSON
//! encoding of a [`WireMessage`]. The console treats payload contents
//! as opaque; the only field it inspects is the [`MessageKind`]
//! discriminant used by the dispatch registry, plus the role
//! declaration that classifies a fresh connection.

use crate::role::{ConnectionRole, PeerAddress};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Errors from encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: u32, max: u32 },
}

/// A wire protocol message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique message ID.
    pub id: String,
    /// Message variant.
    #[serde(flatten)]
    pub payload: WirePayload,
}

impl WireMessage {
    /// Create a message with a fresh ID.
    pub fn new(payload: WirePayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
        }
    }

    /// The dispatch key for this message.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// The different kinds of wire payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePayload {
    /// First frame on every connection: declares the peer's role.
    /// Consumed by the acceptor during classification, never dispatched.
    RoleDeclaration {
        role: ConnectionRole,
        protocol_version: u32,
    },
    /// Agent → console status report.
    AgentReport {
        state: String,
        operating_system: String,
        free_memory: u64,
    },
    /// Worker → console status report.
    WorkerReport {
        running_threads: u32,
        finished_tests: u64,
        errors: u64,
    },
    /// Agent/worker log line forwarded to the console.
    LogReport { level: String, text: String },
    /// Console → agents: start worker processes with these properties.
    StartWorkers {
        properties: BTreeMap<String, String>,
    },
    /// Console → agents: stop the current run.
    StopWorkers,
    /// Console → agents: refresh the script file cache.
    RefreshCache { files: Vec<String> },
    /// Console → agent: the local address the agent should connect back to.
    ConsoleAddress { host: String, port: u16 },
    /// Console client → console control command.
    ClientCommand { command: String },
}

impl WirePayload {
    /// The field-less discriminant used as the dispatch registry key.
    pub fn kind(&self) -> MessageKind {
        match self {
            WirePayload::RoleDeclaration { .. } => MessageKind::RoleDeclaration,
            WirePayload::AgentReport { .. } => MessageKind::AgentReport,
            WirePayload::WorkerReport { .. } => MessageKind::WorkerReport,
            WirePayload::LogReport { .. } => MessageKind::LogReport,
            WirePayload::StartWorkers { .. } => MessageKind::StartWorkers,
            WirePayload::StopWorkers => MessageKind::StopWorkers,
            WirePayload::RefreshCache { .. } => MessageKind::RefreshCache,
            WirePayload::ConsoleAddress { .. } => MessageKind::ConsoleAddress,
            WirePayload::ClientCommand { .. } => MessageKind::ClientCommand,
        }
    }
}

/// Dispatch key: one variant per payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RoleDeclaration,
    AgentReport,
    WorkerReport,
    LogReport,
    StartWorkers,
    StopWorkers,
    RefreshCache,
    ConsoleAddress,
    ClientCommand,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::RoleDeclaration => "role_declaration",
            MessageKind::AgentReport => "agent_report",
            MessageKind::WorkerReport => "worker_report",
            MessageKind::LogReport => "log_report",
            MessageKind::StartWorkers => "start_workers",
            MessageKind::StopWorkers => "stop_workers",
            MessageKind::RefreshCache => "refresh_cache",
            MessageKind::ConsoleAddress => "console_address",
            MessageKind::ClientCommand => "client_command",
        };
        f.write_str(name)
    }
}

/// A decoded message plus the address of the peer that sent it.
///
/// Created by the receiver on successful decode, consumed exactly once
/// by the dispatch registry.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: WireMessage,
    pub sender: PeerAddress,
}

impl ReceivedMessage {
    /// The dispatch key for the contained message.
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

/// Encode a message into a frame (4-byte big-endian length + JSON).
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Drain every complete frame from an accumulator buffer.
///
/// Partial frames are left in the buffer for the next read; the call
/// only fails on an oversized header or undecodable JSON body.
pub fn decode_frames(buf: &mut BytesMut) -> Result<Vec<WireMessage>, FrameError> {
    let mut messages = Vec::new();
    loop {
        if buf.len() < 4 {
            return Ok(messages);
        }
        let mut header = [0u8; 4];
        header.copy_from_slice(&buf[..4]);
        let len = u32::from_be_bytes(header);
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if buf.len() < 4 + len as usize {
            return Ok(messages);
        }
        buf.advance(4);
        let body = buf.split_to(len as usize);
        messages.push(serde_json::from_slice(&body)?);
    }
}
