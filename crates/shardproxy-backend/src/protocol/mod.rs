//! MySQL client/server wire protocol, client side
//!
//! Only what a backend channel needs:
//! - Packet framing with sequence ids and >16MB payload continuation
//! - Handshake and authentication (mysql_native_password, caching_sha2_password)
//! - COM_QUERY text result sets
//! - COM_STMT_PREPARE / COM_STMT_EXECUTE binary result sets
//! - COM_PING / COM_QUIT / COM_STMT_CLOSE

pub mod handshake;
pub mod message;
pub mod packet;

use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Packet header size (3 bytes length + 1 byte sequence id)
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum payload carried by one physical packet
pub const MAX_PAYLOAD_LEN: usize = 0x00FF_FFFF;
/// Max packet size announced in the handshake response
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;
/// utf8mb4_general_ci
pub const UTF8MB4_CHARSET: u8 = 45;

/// Command bytes
pub mod command {
    /// COM_QUIT
    pub const QUIT: u8 = 0x01;
    /// COM_QUERY
    pub const QUERY: u8 = 0x03;
    /// COM_PING
    pub const PING: u8 = 0x0E;
    /// COM_STMT_PREPARE
    pub const STMT_PREPARE: u8 = 0x16;
    /// COM_STMT_EXECUTE
    pub const STMT_EXECUTE: u8 = 0x17;
    /// COM_STMT_CLOSE
    pub const STMT_CLOSE: u8 = 0x19;
}

/// MySQL capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityFlags(u32);

#[allow(missing_docs)]
impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x00000001;
    pub const CLIENT_FOUND_ROWS: u32 = 0x00000002;
    pub const CLIENT_LONG_FLAG: u32 = 0x00000004;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x00000008;
    pub const CLIENT_LOCAL_FILES: u32 = 0x00000080;
    pub const CLIENT_PROTOCOL_41: u32 = 0x00000200;
    pub const CLIENT_SSL: u32 = 0x00000800;
    pub const CLIENT_TRANSACTIONS: u32 = 0x00002000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x00008000;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 0x00010000;
    pub const CLIENT_MULTI_RESULTS: u32 = 0x00020000;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x00040000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x00080000;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x00200000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x01000000;

    /// Wrap raw flags
    pub const fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Whether `flag` is set
    #[inline]
    pub const fn has(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    /// Raw value
    #[inline]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

/// Server status flags carried by OK/EOF packets
pub mod status {
    /// SERVER_STATUS_IN_TRANS
    pub const IN_TRANS: u16 = 0x0001;
    /// SERVER_STATUS_AUTOCOMMIT
    pub const AUTOCOMMIT: u16 = 0x0002;
    /// SERVER_MORE_RESULTS_EXISTS
    pub const MORE_RESULTS_EXISTS: u16 = 0x0008;
}

// ============================================================================
// Payload reader
// ============================================================================

/// Cursor over one packet payload; every read is bounds-checked
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Read from the start of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn short(&self, wanted: usize) -> Error {
        Error::protocol(format!(
            "truncated packet: wanted {wanted} bytes at offset {} of {}",
            self.pos,
            self.data.len()
        ))
    }

    /// Bytes left
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether the payload is exhausted
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Next byte without consuming it
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Take `n` bytes
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(self.short(n));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skip `n` bytes
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Everything that is left
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    #[allow(missing_docs)]
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    #[allow(missing_docs)]
    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    #[allow(missing_docs)]
    pub fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    #[allow(missing_docs)]
    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[allow(missing_docs)]
    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Length-encoded integer; `None` for the NULL marker 0xFB
    pub fn lenenc_int(&mut self) -> Result<Option<u64>> {
        match self.u8()? {
            0xFB => Ok(None),
            0xFC => Ok(Some(u64::from(self.u16()?))),
            0xFD => Ok(Some(u64::from(self.u24()?))),
            0xFE => Ok(Some(self.u64()?)),
            0xFF => Err(Error::protocol("0xFF is not a length-encoded integer")),
            b => Ok(Some(u64::from(b))),
        }
    }

    /// Length-encoded integer where NULL is not allowed
    pub fn lenenc_u64(&mut self) -> Result<u64> {
        self.lenenc_int()?
            .ok_or_else(|| Error::protocol("unexpected NULL length"))
    }

    /// Length-encoded bytes; `None` for NULL
    pub fn lenenc_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        match self.lenenc_int()? {
            None => Ok(None),
            Some(len) => {
                let len = usize::try_from(len)
                    .map_err(|_| Error::protocol("length-encoded string too long"))?;
                self.take(len).map(Some)
            }
        }
    }

    /// Length-encoded string, lossily decoded
    pub fn lenenc_string(&mut self) -> Result<String> {
        let bytes = self.lenenc_bytes()?.unwrap_or_default();
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// NUL-terminated bytes (terminator consumed); the rest if no NUL
    pub fn null_terminated(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }
}

// ============================================================================
// Payload writers
// ============================================================================

/// Append a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 0xFB {
        buf.put_u8(value as u8);
    } else if value <= 0xFFFF {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value <= 0x00FF_FFFF {
        buf.put_u8(0xFD);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Append length-encoded bytes
pub fn put_lenenc_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Append NUL-terminated bytes
pub fn put_null_terminated(buf: &mut BytesMut, value: &[u8]) {
    buf.put_slice(value);
    buf.put_u8(0);
}
