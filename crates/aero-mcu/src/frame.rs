use crate::error::{McuError, Result};

pub const MCU_HEADER_LEN: usize = 16;
pub const MCU_RESPONSE_HEADER_LEN: usize = 8;

/// Frame length is carried in a u16 that includes the header.
pub const MCU_MAX_PAYLOAD_LEN: usize = u16::MAX as usize - MCU_HEADER_LEN;

pub const MCU_PKT_ID: u8 = 0xa0;
pub const MCU_PORT_QUEUE: u16 = 0x8000;
/// `cid` value announcing that the real command id is in `ext_cid`.
pub const MCU_CMD_EXT_CID: u8 = 0xed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McuCommand {
    /// Command addressed directly by `cid`.
    Direct(u8),
    /// Extended command, sent with `cid = MCU_CMD_EXT_CID`.
    Ext(u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum McuQuery {
    Query,
    Set,
    #[default]
    NotApplicable,
}

impl McuQuery {
    fn to_raw(self) -> u8 {
        match self {
            McuQuery::Query => 0,
            McuQuery::Set => 1,
            McuQuery::NotApplicable => 3,
        }
    }

    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(McuQuery::Query),
            1 => Ok(McuQuery::Set),
            3 => Ok(McuQuery::NotApplicable),
            _ => Err(McuError::InvalidPayload("unknown set_query value")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McuHeader {
    pub command: McuCommand,
    pub query: McuQuery,
    pub seq: u8,
    pub payload_len: u16,
}

impl McuHeader {
    /// Extended commands that carry a query ask the MCU to acknowledge the ext cid.
    pub fn ext_cid_ack(&self) -> bool {
        matches!(self.command, McuCommand::Ext(_)) && self.query != McuQuery::NotApplicable
    }

    /// Encode the header followed by `payload`.
    pub fn encode(command: McuCommand, query: McuQuery, seq: u8, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MCU_MAX_PAYLOAD_LEN {
            return Err(McuError::InvalidPayload("payload too large"));
        }
        let header = McuHeader {
            command,
            query,
            seq: seq & 0xf,
            payload_len: payload.len() as u16,
        };
        let (cid, ext_cid) = match command {
            McuCommand::Direct(cid) => (cid, 0),
            McuCommand::Ext(ext_cid) => (MCU_CMD_EXT_CID, ext_cid),
        };

        let mut out = vec![0u8; MCU_HEADER_LEN];
        let total = (MCU_HEADER_LEN + payload.len()) as u16;
        out[0..2].copy_from_slice(&total.to_le_bytes());
        out[2..4].copy_from_slice(&MCU_PORT_QUEUE.to_le_bytes());
        out[4] = cid;
        out[5] = MCU_PKT_ID;
        out[6] = query.to_raw();
        out[7] = header.seq;
        out[9] = ext_cid;
        out[11] = u8::from(header.ext_cid_ack());
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Split an encoded command into its header and payload.
    pub fn decode(buf: &[u8]) -> Result<(McuHeader, &[u8])> {
        if buf.len() < MCU_HEADER_LEN {
            return Err(McuError::InvalidPayload("command shorter than header"));
        }
        let total = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if total != buf.len() {
            return Err(McuError::InvalidPayload("command length mismatch"));
        }
        if buf[5] != MCU_PKT_ID {
            return Err(McuError::InvalidPayload("not an mcu packet"));
        }
        let command = if buf[4] == MCU_CMD_EXT_CID {
            McuCommand::Ext(buf[9])
        } else {
            McuCommand::Direct(buf[4])
        };
        let header = McuHeader {
            command,
            query: McuQuery::from_raw(buf[6])?,
            seq: buf[7],
            payload_len: (total - MCU_HEADER_LEN) as u16,
        };
        if u8::from(header.ext_cid_ack()) != buf[11] {
            return Err(McuError::InvalidPayload("ext_cid_ack does not match command"));
        }
        Ok((header, &buf[MCU_HEADER_LEN..]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuResponse {
    pub seq: u8,
    pub payload: Vec<u8>,
}

impl McuResponse {
    pub fn new(seq: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            seq,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let total = MCU_RESPONSE_HEADER_LEN + self.payload.len();
        let total = u16::try_from(total).map_err(|_| McuError::InvalidPayload("payload too large"))?;
        let mut out = vec![0u8; MCU_RESPONSE_HEADER_LEN];
        out[0..2].copy_from_slice(&total.to_le_bytes());
        out[2..4].copy_from_slice(&u16::from(MCU_PKT_ID).to_le_bytes());
        out[5] = self.seq;
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MCU_RESPONSE_HEADER_LEN {
            return Err(McuError::InvalidPayload("response shorter than header"));
        }
        let total = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if total != buf.len() {
            return Err(McuError::InvalidPayload("response length mismatch"));
        }
        Ok(Self {
            seq: buf[5],
            payload: buf[MCU_RESPONSE_HEADER_LEN..].to_vec(),
        })
    }
}
