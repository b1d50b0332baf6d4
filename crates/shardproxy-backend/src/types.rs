//! Value, column and row types shared by the protocol codec and the engines
//!
//! Values coming back from a shard are typed from the column metadata the
//! backend sends, so rows from different shards compare and merge uniformly.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// SQL value as read from, or bound to, a backend statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Signed integer (TINYINT..BIGINT)
    Int(i64),
    /// Unsigned integer (UNSIGNED columns)
    UInt(u64),
    /// 32-bit floating point (FLOAT)
    Float(f32),
    /// 64-bit floating point (DOUBLE)
    Double(f64),
    /// Text (VARCHAR, TEXT, CHAR, DECIMAL kept in its exact textual form)
    String(String),
    /// Binary data (BLOB, VARBINARY, BINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Date and time (DATETIME, TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Signed duration (TIME), which may exceed 24 hours
    Time(SqlTime),
}

/// MySQL TIME value: a signed duration in the range -838:59:59..838:59:59
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SqlTime {
    /// Whether the duration is negative
    pub negative: bool,
    /// Absolute duration in microseconds
    pub micros: u64,
}

impl SqlTime {
    /// Build from hour/minute/second/microsecond parts
    pub fn from_parts(negative: bool, hours: u64, minutes: u64, seconds: u64, micros: u64) -> Self {
        Self {
            negative,
            micros: ((hours * 60 + minutes) * 60 + seconds) * 1_000_000 + micros,
        }
    }

    /// Signed microseconds
    pub fn signed_micros(&self) -> i128 {
        if self.negative {
            -(self.micros as i128)
        } else {
            self.micros as i128
        }
    }

    /// Parse the textual form `[-]H+:MM:SS[.ffffff]`
    pub fn parse(text: &str) -> Option<Self> {
        let (negative, rest) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (clock, fraction) = match rest.split_once('.') {
            Some((clock, fraction)) => (clock, Some(fraction)),
            None => (rest, None),
        };
        let mut parts = clock.split(':');
        let hours: u64 = parts.next()?.parse().ok()?;
        let minutes: u64 = parts.next()?.parse().ok()?;
        let seconds: u64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || minutes > 59 || seconds > 59 {
            return None;
        }
        let micros = match fraction {
            Some(f) if !f.is_empty() && f.len() <= 6 => {
                let digits: u64 = f.parse().ok()?;
                digits * 10u64.pow(6 - f.len() as u32)
            }
            Some(_) => return None,
            None => 0,
        };
        Some(Self::from_parts(negative, hours, minutes, seconds, micros))
    }
}

impl fmt::Display for SqlTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_secs = self.micros / 1_000_000;
        let frac = self.micros % 1_000_000;
        let sign = if self.negative { "-" } else { "" };
        write!(
            f,
            "{sign}{:02}:{:02}:{:02}",
            total_secs / 3600,
            (total_secs / 60) % 60,
            total_secs % 60
        )?;
        if frac != 0 {
            write!(f, ".{frac:06}")?;
        }
        Ok(())
    }
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Int(_) => "BIGINT",
            Self::UInt(_) => "BIGINT UNSIGNED",
            Self::Float(_) => "FLOAT",
            Self::Double(_) => "DOUBLE",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "BLOB",
            Self::Date(_) => "DATE",
            Self::DateTime(_) => "DATETIME",
            Self::Time(_) => "TIME",
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::UInt(v) => i64::try_from(*v).ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get a bytes slice
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int(_) | Self::UInt(_) | Self::Float(_) | Self::Double(_) => 1,
            Self::String(_) => 2,
            Self::Bytes(_) => 3,
            Self::Date(_) | Self::DateTime(_) => 4,
            Self::Time(_) => 5,
        }
    }

    /// Total order used when merging rows from several shards.
    ///
    /// NULL sorts first, numbers compare across integer/float widths, dates
    /// compare with datetimes at midnight. Values of unrelated kinds order by kind.
    pub fn compare(&self, other: &Self) -> Ordering {
        let (lhs, rhs) = (self.rank(), other.rank());
        if lhs != rhs {
            return lhs.cmp(&rhs);
        }
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.signed_micros().cmp(&b.signed_micros()),
            (a, b) if lhs == 4 => a.as_datetime().cmp(&b.as_datetime()),
            (a, b) => match (a.as_i128(), b.as_i128()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = a.as_f64().unwrap_or(f64::NAN);
                    let y = b.as_f64().unwrap_or(f64::NAN);
                    x.total_cmp(&y)
                }
            },
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Int(v) => Some(i128::from(*v)),
            Self::UInt(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Date(d) => Some(d.and_time(NaiveTime::MIN)),
            Self::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "0x{}", hex(b)),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f")),
            Self::Time(t) => write!(f, "{t}"),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::UInt(u64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Column type codes of the MySQL client/server protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ColumnType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    VarChar,
    Bit,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
    /// Type code this codec does not know; decoded as length-encoded bytes
    Other(u8),
}

impl ColumnType {
    /// Map a wire type code
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Decimal,
            0x01 => Self::Tiny,
            0x02 => Self::Short,
            0x03 => Self::Long,
            0x04 => Self::Float,
            0x05 => Self::Double,
            0x06 => Self::Null,
            0x07 => Self::Timestamp,
            0x08 => Self::LongLong,
            0x09 => Self::Int24,
            0x0A => Self::Date,
            0x0B => Self::Time,
            0x0C => Self::DateTime,
            0x0D => Self::Year,
            0x0F => Self::VarChar,
            0x10 => Self::Bit,
            0xF5 => Self::Json,
            0xF6 => Self::NewDecimal,
            0xF7 => Self::Enum,
            0xF8 => Self::Set,
            0xF9 => Self::TinyBlob,
            0xFA => Self::MediumBlob,
            0xFB => Self::LongBlob,
            0xFC => Self::Blob,
            0xFD => Self::VarString,
            0xFE => Self::String,
            0xFF => Self::Geometry,
            other => Self::Other(other),
        }
    }

    /// Wire type code
    pub fn code(self) -> u8 {
        match self {
            Self::Decimal => 0x00,
            Self::Tiny => 0x01,
            Self::Short => 0x02,
            Self::Long => 0x03,
            Self::Float => 0x04,
            Self::Double => 0x05,
            Self::Null => 0x06,
            Self::Timestamp => 0x07,
            Self::LongLong => 0x08,
            Self::Int24 => 0x09,
            Self::Date => 0x0A,
            Self::Time => 0x0B,
            Self::DateTime => 0x0C,
            Self::Year => 0x0D,
            Self::VarChar => 0x0F,
            Self::Bit => 0x10,
            Self::Json => 0xF5,
            Self::NewDecimal => 0xF6,
            Self::Enum => 0xF7,
            Self::Set => 0xF8,
            Self::TinyBlob => 0xF9,
            Self::MediumBlob => 0xFA,
            Self::LongBlob => 0xFB,
            Self::Blob => 0xFC,
            Self::VarString => 0xFD,
            Self::String => 0xFE,
            Self::Geometry => 0xFF,
            Self::Other(code) => code,
        }
    }

    /// Integer column types
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Tiny | Self::Short | Self::Long | Self::LongLong | Self::Int24 | Self::Year
        )
    }
}

/// Column flag: UNSIGNED
pub const UNSIGNED_FLAG: u16 = 0x0020;
/// Column flag: BINARY
pub const BINARY_FLAG: u16 = 0x0080;
/// Charset id of binary strings
pub const BINARY_CHARSET: u16 = 63;

/// Column metadata from a result-set header (ColumnDefinition41)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Schema (database) name
    pub schema: String,
    /// Virtual table name (alias)
    pub table: String,
    /// Physical table name
    pub org_table: String,
    /// Virtual column name (alias)
    pub name: String,
    /// Physical column name
    pub org_name: String,
    /// Character set id
    pub charset: u16,
    /// Maximum column length
    pub length: u32,
    /// Column type
    pub column_type: ColumnType,
    /// Column flags
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
}

impl Column {
    /// Create a column with just a name and type
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        Self {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            org_name: name.clone(),
            name,
            charset: 45,
            length: 0,
            column_type,
            flags: 0,
            decimals: 0,
        }
    }

    /// Whether the column is UNSIGNED
    #[inline]
    pub fn is_unsigned(&self) -> bool {
        self.flags & UNSIGNED_FLAG != 0
    }

    /// Whether the column holds binary (not character) data
    #[inline]
    pub fn is_binary(&self) -> bool {
        self.charset == BINARY_CHARSET
    }
}

/// A single result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Number of columns
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// All values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume into values
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}
