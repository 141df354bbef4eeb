use anyhow::{bail, Context};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::Serialize;

use super::{Address, TileId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, Serialize)]
#[repr(u8)]
pub enum ShmemMsgType {
    ExReq = 1,
    ShReq = 2,
    InvReq = 3,
    FlushReq = 4,
    WbReq = 5,
    InvFlushCombinedReq = 6,
    NullifyReq = 7,
    ExRep = 8,
    ShRep = 9,
    UpgradeRep = 10,
    InvRep = 11,
    FlushRep = 12,
    WbRep = 13,
}

impl ShmemMsgType {
    /// Replies that complete a tile's outstanding miss.
    pub fn is_terminal_reply(self) -> bool {
        matches!(self, ShmemMsgType::ExRep | ShmemMsgType::ShRep | ShmemMsgType::UpgradeRep)
    }

    /// Requests the directory sends to an L2 that may be answered on its behalf.
    pub fn is_directory_request(self) -> bool {
        matches!(
            self,
            ShmemMsgType::InvReq
                | ShmemMsgType::FlushReq
                | ShmemMsgType::WbReq
                | ShmemMsgType::InvFlushCombinedReq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, Serialize)]
#[repr(u8)]
pub enum MemComponent {
    L1ICache = 1,
    L1DCache = 2,
    L2Cache = 3,
    DramDirectory = 4,
    Dram = 5,
}

impl MemComponent {
    pub fn is_l1(self) -> bool {
        matches!(self, MemComponent::L1ICache | MemComponent::L1DCache)
    }
}

/// Envelope exchanged between cache and directory controllers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmemMsg {
    pub msg_type: ShmemMsgType,
    pub sender_component: MemComponent,
    pub receiver_component: MemComponent,
    pub requester: TileId,
    pub single_receiver: Option<TileId>,
    pub reply_expected: bool,
    pub address: Address,
    pub data: Option<Vec<u8>>,
}

const FLAG_REPLY_EXPECTED: u8 = 1 << 0;
const FLAG_SINGLE_RECEIVER: u8 = 1 << 1;
const FLAG_DATA: u8 = 1 << 2;
const HEADER_BYTES: usize = 24;

impl ShmemMsg {
    pub fn new(
        msg_type: ShmemMsgType,
        sender_component: MemComponent,
        receiver_component: MemComponent,
        requester: TileId,
        address: Address,
    ) -> Self {
        Self {
            msg_type,
            sender_component,
            receiver_component,
            requester,
            single_receiver: None,
            reply_expected: false,
            address,
            data: None,
        }
    }

    pub fn with_single_receiver(mut self, receiver: Option<TileId>) -> Self {
        self.single_receiver = receiver;
        self
    }

    pub fn with_reply_expected(mut self, reply_expected: bool) -> Self {
        self.reply_expected = reply_expected;
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_BYTES + self.data.as_ref().map_or(0, Vec::len)
    }

    // little-endian, fixed header followed by the optional payload
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.reply_expected {
            flags |= FLAG_REPLY_EXPECTED;
        }
        if self.single_receiver.is_some() {
            flags |= FLAG_SINGLE_RECEIVER;
        }
        if self.data.is_some() {
            flags |= FLAG_DATA;
        }

        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.msg_type as u8);
        out.push(self.sender_component as u8);
        out.push(self.receiver_component as u8);
        out.push(flags);
        out.extend_from_slice(&(self.requester as u32).to_le_bytes());
        out.extend_from_slice(&(self.single_receiver.unwrap_or(0) as u32).to_le_bytes());
        out.extend_from_slice(&self.address.to_le_bytes());
        let data = self.data.as_deref().unwrap_or(&[]);
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<ShmemMsg> {
        if bytes.len() < HEADER_BYTES {
            bail!("shmem msg truncated: {} bytes, header needs {}", bytes.len(), HEADER_BYTES);
        }
        let msg_type = ShmemMsgType::from_u8(bytes[0])
            .with_context(|| format!("unrecognized shmem msg type {}", bytes[0]))?;
        let sender_component = MemComponent::from_u8(bytes[1])
            .with_context(|| format!("unrecognized sender component {}", bytes[1]))?;
        let receiver_component = MemComponent::from_u8(bytes[2])
            .with_context(|| format!("unrecognized receiver component {}", bytes[2]))?;
        let flags = bytes[3];
        if flags & !(FLAG_REPLY_EXPECTED | FLAG_SINGLE_RECEIVER | FLAG_DATA) != 0 {
            bail!("unknown shmem msg flags {:#04x}", flags);
        }

        let requester = u32::from_le_bytes(bytes[4..8].try_into()?) as TileId;
        let single_receiver = u32::from_le_bytes(bytes[8..12].try_into()?) as TileId;
        let address = u64::from_le_bytes(bytes[12..20].try_into()?);
        let data_len = u32::from_le_bytes(bytes[20..24].try_into()?) as usize;

        let payload = &bytes[HEADER_BYTES..];
        if payload.len() != data_len {
            bail!(
                "shmem msg {:?} @ {:#x}: payload is {} bytes, header says {}",
                msg_type,
                address,
                payload.len(),
                data_len
            );
        }
        let data = if flags & FLAG_DATA != 0 {
            Some(payload.to_vec())
        } else if data_len != 0 {
            bail!("shmem msg {:?} @ {:#x} has a payload but no data flag", msg_type, address);
        } else {
            None
        };

        Ok(ShmemMsg {
            msg_type,
            sender_component,
            receiver_component,
            requester,
            single_receiver: (flags & FLAG_SINGLE_RECEIVER != 0).then_some(single_receiver),
            reply_expected: flags & FLAG_REPLY_EXPECTED != 0,
            address,
            data,
        })
    }
}
