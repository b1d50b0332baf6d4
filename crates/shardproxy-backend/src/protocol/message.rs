//! Command-phase messages: encoders for client commands and parsers for
//! server responses (OK, ERR, EOF, column definitions, text and binary rows)

use super::{command, put_lenenc_bytes, CapabilityFlags, PacketReader};
use crate::error::{Error, Result};
use crate::types::{Column, ColumnType, Row, SqlTime, Value};
use bytes::{BufMut, BytesMut};
use chrono::{NaiveDate, NaiveDateTime};

// ============================================================================
// OK / ERR / EOF
// ============================================================================

/// OK packet (also the deprecate-EOF result-set terminator)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// Rows changed by the statement
    pub affected_rows: u64,
    /// Last AUTO_INCREMENT value generated
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Warning count
    pub warnings: u16,
    /// Human readable info
    pub info: String,
}

impl OkPacket {
    /// Parse an OK payload (header byte 0x00 or 0xFE)
    pub fn parse(data: &[u8], caps: CapabilityFlags) -> Result<Self> {
        let mut r = PacketReader::new(data);
        match r.u8()? {
            0x00 | 0xFE => {}
            other => {
                return Err(Error::protocol(format!(
                    "expected OK packet, got header 0x{other:02X}"
                )))
            }
        }
        let affected_rows = r.lenenc_u64()?;
        let last_insert_id = r.lenenc_u64()?;
        let (status_flags, warnings) = if caps.has(CapabilityFlags::CLIENT_PROTOCOL_41) {
            (r.u16()?, r.u16()?)
        } else {
            (0, 0)
        };
        let info = String::from_utf8_lossy(r.rest()).into_owned();
        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    /// Server error code
    pub code: u16,
    /// SQLSTATE, `HY000` when the server sent none
    pub sql_state: String,
    /// Error message
    pub message: String,
}

impl ErrPacket {
    /// Parse an ERR payload (header byte 0xFF)
    pub fn parse(data: &[u8], _caps: CapabilityFlags) -> Result<Self> {
        let mut r = PacketReader::new(data);
        if r.u8()? != 0xFF {
            return Err(Error::protocol("expected ERR packet"));
        }
        let code = r.u16()?;
        let sql_state = if r.peek() == Some(b'#') {
            r.skip(1)?;
            String::from_utf8_lossy(r.take(5)?).into_owned()
        } else {
            "HY000".to_string()
        };
        let message = String::from_utf8_lossy(r.rest()).into_owned();
        Ok(Self {
            code,
            sql_state,
            message,
        })
    }

    /// Convert into the crate error
    pub fn into_error(self) -> Error {
        Error::Server {
            code: self.code,
            sql_state: self.sql_state,
            message: self.message,
        }
    }
}

/// Whether `data` terminates a row sequence under the negotiated capabilities
pub fn is_terminator(data: &[u8], caps: CapabilityFlags) -> bool {
    if data.first() != Some(&0xFE) {
        return false;
    }
    if caps.has(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
        data.len() < super::MAX_PAYLOAD_LEN
    } else {
        data.len() < 9
    }
}

/// Parse a row-sequence terminator (classic EOF or OK) into an OK summary
pub fn parse_terminator(data: &[u8], caps: CapabilityFlags) -> Result<OkPacket> {
    if caps.has(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
        return OkPacket::parse(data, caps);
    }
    let mut r = PacketReader::new(data);
    r.skip(1)?;
    let (warnings, status_flags) = if r.remaining() >= 4 {
        (r.u16()?, r.u16()?)
    } else {
        (0, 0)
    };
    Ok(OkPacket {
        status_flags,
        warnings,
        ..OkPacket::default()
    })
}

// ============================================================================
// Result set header and column definitions
// ============================================================================

/// First packet of a COM_QUERY / COM_STMT_EXECUTE response
#[derive(Debug)]
pub enum ResponseHeader {
    /// Statement produced no result set
    Ok(OkPacket),
    /// Backend rejected the statement
    Err(ErrPacket),
    /// Server asks the client to upload a local file
    LocalInfile(String),
    /// A result set with this many columns follows
    ResultSet(u64),
}

impl ResponseHeader {
    /// Classify a response's first packet
    pub fn parse(data: &[u8], caps: CapabilityFlags) -> Result<Self> {
        match data.first() {
            Some(0x00) => Ok(Self::Ok(OkPacket::parse(data, caps)?)),
            Some(0xFF) => Ok(Self::Err(ErrPacket::parse(data, caps)?)),
            Some(0xFB) => Ok(Self::LocalInfile(
                String::from_utf8_lossy(&data[1..]).into_owned(),
            )),
            Some(_) => {
                let count = PacketReader::new(data).lenenc_u64()?;
                if count == 0 {
                    return Err(Error::protocol("result set with zero columns"));
                }
                Ok(Self::ResultSet(count))
            }
            None => Err(Error::protocol("empty response packet")),
        }
    }
}

/// Parse ColumnDefinition41
pub fn parse_column(data: &[u8]) -> Result<Column> {
    let mut r = PacketReader::new(data);
    let _catalog = r.lenenc_string()?;
    let schema = r.lenenc_string()?;
    let table = r.lenenc_string()?;
    let org_table = r.lenenc_string()?;
    let name = r.lenenc_string()?;
    let org_name = r.lenenc_string()?;
    let _fixed_len = r.lenenc_u64()?;
    let charset = r.u16()?;
    let length = r.u32()?;
    let column_type = ColumnType::from_code(r.u8()?);
    let flags = r.u16()?;
    let decimals = r.u8()?;
    Ok(Column {
        schema,
        table,
        org_table,
        name,
        org_name,
        charset,
        length,
        column_type,
        flags,
        decimals,
    })
}

// ============================================================================
// Rows
// ============================================================================

fn invalid_value(column: &Column, what: &str) -> Error {
    Error::protocol(format!("column '{}': invalid {what} value", column.name))
}

fn string_or_bytes(column: &Column, raw: &[u8]) -> Value {
    if column.is_binary() {
        return Value::Bytes(raw.to_vec());
    }
    match std::str::from_utf8(raw) {
        Ok(s) => Value::String(s.to_string()),
        Err(_) => Value::Bytes(raw.to_vec()),
    }
}

/// Decode one text-protocol cell
pub fn decode_text_value(column: &Column, raw: &[u8]) -> Result<Value> {
    let text = || std::str::from_utf8(raw).map_err(|_| invalid_value(column, "utf-8"));
    let value = match column.column_type {
        t if t.is_integer() => {
            let s = text()?;
            if column.is_unsigned() {
                Value::UInt(s.parse().map_err(|_| invalid_value(column, "integer"))?)
            } else {
                Value::Int(s.parse().map_err(|_| invalid_value(column, "integer"))?)
            }
        }
        ColumnType::Float => Value::Float(text()?.parse().map_err(|_| invalid_value(column, "float"))?),
        ColumnType::Double => {
            Value::Double(text()?.parse().map_err(|_| invalid_value(column, "double"))?)
        }
        ColumnType::Decimal | ColumnType::NewDecimal | ColumnType::Json => {
            Value::String(text()?.to_string())
        }
        ColumnType::Date => {
            let s = text()?;
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Value::Date)
                .unwrap_or_else(|_| Value::String(s.to_string()))
        }
        ColumnType::DateTime | ColumnType::Timestamp => {
            let s = text()?;
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .map(Value::DateTime)
                .unwrap_or_else(|_| Value::String(s.to_string()))
        }
        ColumnType::Time => {
            let s = text()?;
            SqlTime::parse(s)
                .map(Value::Time)
                .unwrap_or_else(|| Value::String(s.to_string()))
        }
        ColumnType::Null => Value::Null,
        ColumnType::Bit | ColumnType::Geometry | ColumnType::Other(_) => Value::Bytes(raw.to_vec()),
        _ => string_or_bytes(column, raw),
    };
    Ok(value)
}

/// Decode a text-protocol row
pub fn decode_text_row(data: &[u8], columns: &[Column]) -> Result<Row> {
    let mut r = PacketReader::new(data);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let value = match r.lenenc_bytes()? {
            None => Value::Null,
            Some(raw) => decode_text_value(column, raw)?,
        };
        values.push(value);
    }
    Ok(Row::new(values))
}

fn decode_binary_temporal(r: &mut PacketReader<'_>, column: &Column) -> Result<Value> {
    let len = r.u8()?;
    let date_only = column.column_type == ColumnType::Date;
    if len == 0 {
        let zero = if date_only {
            "0000-00-00"
        } else {
            "0000-00-00 00:00:00"
        };
        return Ok(Value::String(zero.to_string()));
    }
    if !matches!(len, 4 | 7 | 11) {
        return Err(invalid_value(column, "temporal length"));
    }
    let year = i32::from(r.u16()?);
    let month = u32::from(r.u8()?);
    let day = u32::from(r.u8()?);
    let (hour, minute, second) = if len >= 7 {
        (u32::from(r.u8()?), u32::from(r.u8()?), u32::from(r.u8()?))
    } else {
        (0, 0, 0)
    };
    let micros = if len == 11 { r.u32()? } else { 0 };

    let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
        return Ok(Value::String(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
        )));
    };
    if date_only {
        return Ok(Value::Date(date));
    }
    date.and_hms_micro_opt(hour, minute, second, micros)
        .map(Value::DateTime)
        .ok_or_else(|| invalid_value(column, "datetime"))
}

fn decode_binary_time(r: &mut PacketReader<'_>, column: &Column) -> Result<Value> {
    let len = r.u8()?;
    if len == 0 {
        return Ok(Value::Time(SqlTime::from_parts(false, 0, 0, 0, 0)));
    }
    if !matches!(len, 8 | 12) {
        return Err(invalid_value(column, "time length"));
    }
    let negative = r.u8()? == 1;
    let days = u64::from(r.u32()?);
    let hours = u64::from(r.u8()?);
    let minutes = u64::from(r.u8()?);
    let seconds = u64::from(r.u8()?);
    let micros = if len == 12 { u64::from(r.u32()?) } else { 0 };
    Ok(Value::Time(SqlTime::from_parts(
        negative,
        days * 24 + hours,
        minutes,
        seconds,
        micros,
    )))
}

fn decode_binary_value(r: &mut PacketReader<'_>, column: &Column) -> Result<Value> {
    let unsigned = column.is_unsigned();
    let value = match column.column_type {
        ColumnType::Tiny => {
            let b = r.u8()?;
            if unsigned {
                Value::UInt(u64::from(b))
            } else {
                Value::Int(i64::from(b as i8))
            }
        }
        ColumnType::Short | ColumnType::Year => {
            let v = r.u16()?;
            if unsigned {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i16))
            }
        }
        ColumnType::Long | ColumnType::Int24 => {
            let v = r.u32()?;
            if unsigned {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i32))
            }
        }
        ColumnType::LongLong => {
            let v = r.u64()?;
            if unsigned {
                Value::UInt(v)
            } else {
                Value::Int(v as i64)
            }
        }
        ColumnType::Float => Value::Float(f32::from_bits(r.u32()?)),
        ColumnType::Double => Value::Double(f64::from_bits(r.u64()?)),
        ColumnType::Date | ColumnType::DateTime | ColumnType::Timestamp => {
            decode_binary_temporal(r, column)?
        }
        ColumnType::Time => decode_binary_time(r, column)?,
        ColumnType::Null => Value::Null,
        ColumnType::Decimal | ColumnType::NewDecimal | ColumnType::Json => {
            Value::String(r.lenenc_string()?)
        }
        ColumnType::Bit | ColumnType::Geometry | ColumnType::Other(_) => {
            Value::Bytes(r.lenenc_bytes()?.unwrap_or_default().to_vec())
        }
        _ => string_or_bytes(column, r.lenenc_bytes()?.unwrap_or_default()),
    };
    Ok(value)
}

/// Decode a binary-protocol row (COM_STMT_EXECUTE result)
pub fn decode_binary_row(data: &[u8], columns: &[Column]) -> Result<Row> {
    let mut r = PacketReader::new(data);
    if r.u8()? != 0x00 {
        return Err(Error::protocol("binary row must start with 0x00"));
    }
    let bitmap = r.take((columns.len() + 7 + 2) / 8)?;
    let mut values = Vec::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        let bit = idx + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(decode_binary_value(&mut r, column)?);
        }
    }
    Ok(Row::new(values))
}

// ============================================================================
// Prepared statements
// ============================================================================

/// COM_STMT_PREPARE_OK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Server-side statement id
    pub statement_id: u32,
    /// Columns in the result set (0 for non-queries)
    pub num_columns: u16,
    /// Placeholders to bind
    pub num_params: u16,
    /// Warning count
    pub warnings: u16,
}

impl StmtPrepareOk {
    /// Parse the first packet of a COM_STMT_PREPARE response
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(data);
        if r.u8()? != 0x00 {
            return Err(Error::protocol("expected COM_STMT_PREPARE_OK"));
        }
        let statement_id = r.u32()?;
        let num_columns = r.u16()?;
        let num_params = r.u16()?;
        let warnings = if r.remaining() >= 3 {
            r.skip(1)?;
            r.u16()?
        } else {
            0
        };
        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }
}

// ============================================================================
// Encoders
// ============================================================================

/// COM_QUERY
pub fn encode_query(sql: &str) -> BytesMut {
    encode_with_command(command::QUERY, sql.as_bytes())
}

/// COM_STMT_PREPARE
pub fn encode_prepare(sql: &str) -> BytesMut {
    encode_with_command(command::STMT_PREPARE, sql.as_bytes())
}

/// COM_STMT_CLOSE
pub fn encode_stmt_close(statement_id: u32) -> BytesMut {
    encode_with_command(command::STMT_CLOSE, &statement_id.to_le_bytes())
}

/// COM_PING
pub fn encode_ping() -> BytesMut {
    encode_with_command(command::PING, &[])
}

/// COM_QUIT
pub fn encode_quit() -> BytesMut {
    encode_with_command(command::QUIT, &[])
}

fn encode_with_command(cmd: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(cmd);
    buf.put_slice(body);
    buf
}

fn param_type(value: &Value) -> (ColumnType, bool) {
    match value {
        Value::Null => (ColumnType::Null, false),
        Value::Int(_) => (ColumnType::LongLong, false),
        Value::UInt(_) => (ColumnType::LongLong, true),
        Value::Float(_) => (ColumnType::Float, false),
        Value::Double(_) => (ColumnType::Double, false),
        Value::String(_) => (ColumnType::VarString, false),
        Value::Bytes(_) => (ColumnType::Blob, false),
        Value::Date(_) => (ColumnType::Date, false),
        Value::DateTime(_) => (ColumnType::DateTime, false),
        Value::Time(_) => (ColumnType::Time, false),
    }
}

fn put_binary_value(buf: &mut BytesMut, value: &Value) {
    use chrono::{Datelike, Timelike};
    match value {
        Value::Null => {}
        Value::Int(v) => buf.put_i64_le(*v),
        Value::UInt(v) => buf.put_u64_le(*v),
        Value::Float(v) => buf.put_f32_le(*v),
        Value::Double(v) => buf.put_f64_le(*v),
        Value::String(s) => put_lenenc_bytes(buf, s.as_bytes()),
        Value::Bytes(b) => put_lenenc_bytes(buf, b),
        Value::Date(d) => {
            buf.put_u8(4);
            buf.put_u16_le(d.year() as u16);
            buf.put_u8(d.month() as u8);
            buf.put_u8(d.day() as u8);
        }
        Value::DateTime(dt) => {
            let micros = dt.nanosecond() / 1_000;
            buf.put_u8(if micros == 0 { 7 } else { 11 });
            buf.put_u16_le(dt.year() as u16);
            buf.put_u8(dt.month() as u8);
            buf.put_u8(dt.day() as u8);
            buf.put_u8(dt.hour() as u8);
            buf.put_u8(dt.minute() as u8);
            buf.put_u8(dt.second() as u8);
            if micros != 0 {
                buf.put_u32_le(micros);
            }
        }
        Value::Time(t) => {
            let micros = t.micros % 1_000_000;
            let total_secs = t.micros / 1_000_000;
            buf.put_u8(if micros == 0 { 8 } else { 12 });
            buf.put_u8(u8::from(t.negative));
            buf.put_u32_le((total_secs / 86_400) as u32);
            buf.put_u8(((total_secs / 3600) % 24) as u8);
            buf.put_u8(((total_secs / 60) % 60) as u8);
            buf.put_u8((total_secs % 60) as u8);
            if micros != 0 {
                buf.put_u32_le(micros as u32);
            }
        }
    }
}

/// COM_STMT_EXECUTE with every parameter bound
pub fn encode_execute(statement_id: u32, params: &[Value]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16 + params.len() * 10);
    buf.put_u8(command::STMT_EXECUTE);
    buf.put_u32_le(statement_id);
    buf.put_u8(0x00); // CURSOR_TYPE_NO_CURSOR
    buf.put_u32_le(1);

    if params.is_empty() {
        return buf;
    }

    let mut bitmap = vec![0u8; params.len().div_ceil(8)];
    for (idx, value) in params.iter().enumerate() {
        if value.is_null() {
            bitmap[idx / 8] |= 1 << (idx % 8);
        }
    }
    buf.put_slice(&bitmap);
    buf.put_u8(1);
    for value in params {
        let (ty, unsigned) = param_type(value);
        buf.put_u8(ty.code());
        buf.put_u8(if unsigned { 0x80 } else { 0x00 });
    }
    for value in params {
        put_binary_value(&mut buf, value);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::put_lenenc_int;
    use crate::types::UNSIGNED_FLAG;

    const CAPS_41: CapabilityFlags = CapabilityFlags::new(CapabilityFlags::CLIENT_PROTOCOL_41);

    #[test]
    fn test_parse_ok() {
        let data = [0x00, 0x03, 0x2A, 0x02, 0x00, 0x01, 0x00];
        let ok = OkPacket::parse(&data, CAPS_41).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 1);
    }

    #[test]
    fn test_parse_err_with_sql_state() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&1146u16.to_le_bytes());
        data.extend_from_slice(b"#42S02Table 'db.t' doesn't exist");
        let err = ErrPacket::parse(&data, CAPS_41).unwrap();
        assert_eq!(err.code, 1146);
        assert_eq!(err.sql_state, "42S02");
        assert_eq!(err.message, "Table 'db.t' doesn't exist");
    }

    #[test]
    fn test_terminator_detection() {
        let eof = [0xFE, 0x00, 0x00, 0x02, 0x00];
        assert!(is_terminator(&eof, CAPS_41));
        let deprecate = CapabilityFlags::new(
            CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_DEPRECATE_EOF,
        );
        let ok = [0xFE, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
        assert!(is_terminator(&ok, deprecate));
        assert_eq!(parse_terminator(&ok, deprecate).unwrap().status_flags, 2);
        // a row starting with an 8-byte length prefix is not a classic EOF
        let mut row = vec![0xFE];
        row.extend_from_slice(&[0u8; 12]);
        assert!(!is_terminator(&row, CAPS_41));
    }

    #[test]
    fn test_response_header_classification() {
        assert!(matches!(
            ResponseHeader::parse(&[0x02], CAPS_41).unwrap(),
            ResponseHeader::ResultSet(2)
        ));
        assert!(matches!(
            ResponseHeader::parse(b"\xFBdata.csv", CAPS_41).unwrap(),
            ResponseHeader::LocalInfile(name) if name == "data.csv"
        ));
    }

    fn column_packet(name: &str, ty: ColumnType, flags: u16, charset: u16) -> BytesMut {
        let mut buf = BytesMut::new();
        for part in ["def", "shop", "orders", "orders", name, name] {
            put_lenenc_bytes(&mut buf, part.as_bytes());
        }
        put_lenenc_int(&mut buf, 0x0C);
        buf.put_u16_le(charset);
        buf.put_u32_le(20);
        buf.put_u8(ty.code());
        buf.put_u16_le(flags);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf
    }

    #[test]
    fn test_parse_column_definition() {
        let col = parse_column(&column_packet("id", ColumnType::LongLong, UNSIGNED_FLAG, 63))
            .unwrap();
        assert_eq!(col.name, "id");
        assert_eq!(col.schema, "shop");
        assert_eq!(col.column_type, ColumnType::LongLong);
        assert!(col.is_unsigned());
    }

    #[test]
    fn test_decode_text_row() {
        let columns = vec![
            Column::new("id", ColumnType::LongLong),
            Column::new("name", ColumnType::VarString),
            Column::new("created", ColumnType::DateTime),
            Column::new("price", ColumnType::NewDecimal),
        ];
        let mut buf = BytesMut::new();
        put_lenenc_bytes(&mut buf, b"-7");
        buf.put_u8(0xFB);
        put_lenenc_bytes(&mut buf, b"2024-05-01 10:20:30");
        put_lenenc_bytes(&mut buf, b"19.90");

        let row = decode_text_row(&buf, &columns).unwrap();
        assert_eq!(row.get(0), Some(&Value::Int(-7)));
        assert_eq!(row.get(1), Some(&Value::Null));
        assert!(matches!(row.get(2), Some(Value::DateTime(_))));
        assert_eq!(row.get(3), Some(&Value::String("19.90".into())));
    }

    #[test]
    fn test_decode_text_rejects_bad_integer() {
        let columns = vec![Column::new("id", ColumnType::Long)];
        let mut buf = BytesMut::new();
        put_lenenc_bytes(&mut buf, b"abc");
        assert!(matches!(
            decode_text_row(&buf, &columns),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn test_decode_binary_row_with_nulls() {
        let mut unsigned = Column::new("qty", ColumnType::Long);
        unsigned.flags = UNSIGNED_FLAG;
        let columns = vec![
            Column::new("id", ColumnType::LongLong),
            Column::new("note", ColumnType::VarString),
            unsigned,
            Column::new("day", ColumnType::Date),
        ];
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        // column 1 NULL -> bit 3
        buf.put_u8(0b0000_1000);
        buf.put_i64_le(-5);
        buf.put_u32_le(4_000_000_000);
        buf.put_u8(4);
        buf.put_u16_le(2024);
        buf.put_u8(2);
        buf.put_u8(29);

        let row = decode_binary_row(&buf, &columns).unwrap();
        assert_eq!(row.get(0), Some(&Value::Int(-5)));
        assert_eq!(row.get(1), Some(&Value::Null));
        assert_eq!(row.get(2), Some(&Value::UInt(4_000_000_000)));
        assert_eq!(
            row.get(3),
            Some(&Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()))
        );
    }

    #[test]
    fn test_encode_execute_layout() {
        let buf = encode_execute(7, &[Value::Int(1), Value::Null, Value::from("x")]);
        let mut r = PacketReader::new(&buf);
        assert_eq!(r.u8().unwrap(), command::STMT_EXECUTE);
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.u8().unwrap(), 0);
        assert_eq!(r.u32().unwrap(), 1);
        assert_eq!(r.u8().unwrap(), 0b010);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.take(6).unwrap(), &[0x08, 0, 0x06, 0, 0xFD, 0]);
        assert_eq!(r.u64().unwrap(), 1);
        assert_eq!(r.lenenc_bytes().unwrap(), Some(&b"x"[..]));
        assert!(r.is_empty());
    }

    #[test]
    fn test_stmt_prepare_ok() {
        let data = [0x00, 9, 0, 0, 0, 2, 0, 1, 0, 0, 0, 0];
        let ok = StmtPrepareOk::parse(&data).unwrap();
        assert_eq!(ok.statement_id, 9);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 1);
    }
}
