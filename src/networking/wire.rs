// Copyright (c) 2026 Driftsync
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Wire codec: `[type: u8][canonical payload]` frames.
//!
//! The tag table is fixed for cross-implementation compatibility; field
//! names keep their documented camelCase spelling so a JSON-codec port maps
//! 1:1. The codec enforces no size policy of its own (callers do), only an
//! allocation guard bounded by the input length.

use crate::core::channel::ChannelDigest;
use crate::core::ports::Priority;
use crate::core::types::{
    decode_canonical_limited, encode_canonical, ChannelId, CodecError, LogEntry, NodeId, StreamId,
    VersionVector,
};
use serde::{Deserialize, Serialize};

const TAG_PING: u8 = 0;
const TAG_ACK: u8 = 1;
const TAG_PING_REQ: u8 = 2;
const TAG_DIGEST_REQUEST: u8 = 3;
const TAG_DIGEST_RESPONSE: u8 = 4;
const TAG_DELTA_REQUEST: u8 = 5;
const TAG_DELTA_RESPONSE: u8 = 6;

/// Direct liveness probe.
///
/// `incarnation` carries the sender's own incarnation; `suspect` is set when
/// the prober currently marks the target suspected or unreachable, giving
/// the target the evidence it needs to refute with a higher incarnation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    /// Probing node.
    pub sender: NodeId,
    /// Probe sequence, matched by the ack.
    pub sequence: u64,
    /// Sender's own incarnation.
    pub incarnation: u64,
    /// The prober considers the target suspected or unreachable.
    pub suspect: bool,
}

/// Probe acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    /// Acknowledging node.
    pub sender: NodeId,
    /// Sequence being acknowledged.
    pub sequence: u64,
    /// Sender's own incarnation.
    pub incarnation: u64,
}

/// Request to probe `target` on the original sender's behalf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReq {
    /// Original prober.
    pub sender: NodeId,
    /// The original probe sequence.
    pub sequence: u64,
    /// Node to probe indirectly.
    pub target: NodeId,
    /// Sender's own incarnation.
    pub incarnation: u64,
}

/// Anti-entropy step 1: the initiator's digests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestRequest {
    /// Initiating node.
    pub sender: NodeId,
    /// Version summaries for every local channel.
    pub digests: Vec<ChannelDigest>,
}

/// Anti-entropy step 2: the responder's digests for shared channels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestResponse {
    /// Responding node.
    pub sender: NodeId,
    /// Version summaries for channels both sides know.
    pub digests: Vec<ChannelDigest>,
}

/// Anti-entropy step 3: ask for entries above `since`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRequest {
    /// Requesting node.
    pub sender: NodeId,
    /// Channel to fill.
    pub channel_id: ChannelId,
    /// Stream to fill.
    pub stream_id: StreamId,
    /// Requester's current version vector.
    pub since: VersionVector,
}

/// Anti-entropy step 4: the missing entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    /// Responding node.
    pub sender: NodeId,
    /// Channel being filled.
    pub channel_id: ChannelId,
    /// Stream being filled.
    pub stream_id: StreamId,
    /// Entries above the requested version, batched to a transport-safe
    /// size by the responder.
    pub entries: Vec<LogEntry>,
}

/// Every protocol message, tagged for the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// Tag 0.
    Ping(Ping),
    /// Tag 1.
    Ack(Ack),
    /// Tag 2.
    PingReq(PingReq),
    /// Tag 3.
    DigestRequest(DigestRequest),
    /// Tag 4.
    DigestResponse(DigestResponse),
    /// Tag 5.
    DeltaRequest(DeltaRequest),
    /// Tag 6.
    DeltaResponse(DeltaResponse),
}

impl WireMessage {
    /// Wire tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            WireMessage::Ping(_) => TAG_PING,
            WireMessage::Ack(_) => TAG_ACK,
            WireMessage::PingReq(_) => TAG_PING_REQ,
            WireMessage::DigestRequest(_) => TAG_DIGEST_REQUEST,
            WireMessage::DigestResponse(_) => TAG_DIGEST_RESPONSE,
            WireMessage::DeltaRequest(_) => TAG_DELTA_REQUEST,
            WireMessage::DeltaResponse(_) => TAG_DELTA_RESPONSE,
        }
    }

    /// Claimed sender of the message.
    pub fn sender(&self) -> &NodeId {
        match self {
            WireMessage::Ping(m) => &m.sender,
            WireMessage::Ack(m) => &m.sender,
            WireMessage::PingReq(m) => &m.sender,
            WireMessage::DigestRequest(m) => &m.sender,
            WireMessage::DigestResponse(m) => &m.sender,
            WireMessage::DeltaRequest(m) => &m.sender,
            WireMessage::DeltaResponse(m) => &m.sender,
        }
    }

    /// Send priority: failure-detector traffic must not be starved behind
    /// bulk deltas.
    pub fn priority(&self) -> Priority {
        match self {
            WireMessage::Ping(_) | WireMessage::Ack(_) | WireMessage::PingReq(_) => Priority::High,
            _ => Priority::Normal,
        }
    }

    /// Encode to a tagged frame.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let payload = match self {
            WireMessage::Ping(m) => encode_canonical(m)?,
            WireMessage::Ack(m) => encode_canonical(m)?,
            WireMessage::PingReq(m) => encode_canonical(m)?,
            WireMessage::DigestRequest(m) => encode_canonical(m)?,
            WireMessage::DigestResponse(m) => encode_canonical(m)?,
            WireMessage::DeltaRequest(m) => encode_canonical(m)?,
            WireMessage::DeltaResponse(m) => encode_canonical(m)?,
        };
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(self.tag());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode a tagged frame. Any malformed input is a decode error; the
    /// caller reports it as a corrupted message and drops it.
    pub fn decode(bytes: &[u8]) -> Result<WireMessage, CodecError> {
        let (&tag, payload) = bytes.split_first().ok_or(CodecError::Deserialize)?;
        let cap = payload.len();
        Ok(match tag {
            TAG_PING => WireMessage::Ping(decode_canonical_limited(payload, cap)?),
            TAG_ACK => WireMessage::Ack(decode_canonical_limited(payload, cap)?),
            TAG_PING_REQ => WireMessage::PingReq(decode_canonical_limited(payload, cap)?),
            TAG_DIGEST_REQUEST => {
                WireMessage::DigestRequest(decode_canonical_limited(payload, cap)?)
            }
            TAG_DIGEST_RESPONSE => {
                WireMessage::DigestResponse(decode_canonical_limited(payload, cap)?)
            }
            TAG_DELTA_REQUEST => WireMessage::DeltaRequest(decode_canonical_limited(payload, cap)?),
            TAG_DELTA_RESPONSE => {
                WireMessage::DeltaResponse(decode_canonical_limited(payload, cap)?)
            }
            _ => return Err(CodecError::Deserialize),
        })
    }
}
