#![forbid(unsafe_code)]

//! Out-of-band command channel to a device microcontroller.
//!
//! Commands are framed with a fixed 16-byte header, tagged with a 4-bit sequence number and
//! handed to an [`McuTransport`]. Only one command is in flight at a time; a command that expects
//! a response blocks until the receive side delivers a response with a matching sequence number
//! or the response timeout expires.
//!
//! Command header (all integer fields little-endian):
//!
//! ```text
//! 0         2         4     5          6          7     8   9         10  11            12     16
//! +---------+---------+-----+----------+----------+-----+---+---------+---+-------------+------+
//! | len u16 | pq_id   | cid | pkt_type | set_query| seq | - | ext_cid | - | ext_cid_ack | rsvd |
//! +---------+---------+-----+----------+----------+-----+---+---------+---+-------------+------+
//! ```
//!
//! Response header:
//!
//! ```text
//! 0         2              4     5     6      8
//! +---------+--------------+-----+-----+------+
//! | len u16 | pkt_type u16 | eid | seq | rsvd |
//! +---------+--------------+-----+-----+------+
//! ```

mod channel;
mod error;
mod frame;

pub use channel::{McuChannel, McuTransport, DEFAULT_RESPONSE_TIMEOUT, MAX_QUEUED_RESPONSES};
pub use error::{McuError, Result};
pub use frame::{
    McuCommand, McuHeader, McuQuery, McuResponse, MCU_CMD_EXT_CID, MCU_HEADER_LEN,
    MCU_MAX_PAYLOAD_LEN, MCU_PKT_ID, MCU_PORT_QUEUE, MCU_RESPONSE_HEADER_LEN,
};
