//! The tagged value domain of the expression language.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::NaiveDateTime;
use serde::Serialize;

/// Most fractional digits ever shown for a float value.
pub const MAX_FLOAT_DIGITS: u8 = 7;

const FIFTY_SIX_BIT_MASK: u64 = (1 << 56) - 1;

/// A stepper driver address: board number and driver number on that board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriverId {
    pub board: u32,
    pub port: u32,
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.board, self.port)
    }
}

/// Opaque handle onto an object-model node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObjectHandle(pub u32);

/// A value in the expression language.
///
/// Date-times and large unsigned values carry a 56-bit payload; the
/// comparison rules work on that payload directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Char(char),
    Int(i32),
    Uint(u32),
    Uint64(u64),
    DateTime(u64),
    /// A float together with the number of fractional digits to display.
    Float(f64, u8),
    StaticStr(&'static str),
    Str(String),
    Driver(DriverId),
    Ip(Ipv4Addr),
    Mac([u8; 6]),
    Object(ObjectHandle),
}

impl Value {
    pub fn float(value: f64, decimals: u8) -> Self {
        Value::Float(value, decimals.clamp(1, MAX_FLOAT_DIGITS))
    }

    pub fn datetime(seconds: u64) -> Self {
        Value::DateTime(seconds & FIFTY_SIX_BIT_MASK)
    }

    pub fn uint64(value: u64) -> Self {
        Value::Uint64(value & FIFTY_SIX_BIT_MASK)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "Boolean",
            Value::Char(_) => "character",
            Value::Int(_) => "integer",
            Value::Uint(_) => "unsigned integer",
            Value::Uint64(_) => "large unsigned integer",
            Value::DateTime(_) => "date-time",
            Value::Float(..) => "float",
            Value::StaticStr(_) | Value::Str(_) => "string",
            Value::Driver(_) => "driver ID",
            Value::Ip(_) => "IP address",
            Value::Mac(_) => "MAC address",
            Value::Object(_) => "object",
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::StaticStr(_) | Value::Str(_))
    }

    /// String content regardless of the static/heap flavour.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::StaticStr(s) => Some(s),
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The 56-bit payload of a date-time or large unsigned value.
    pub fn payload_56bit(&self) -> u64 {
        match self {
            Value::Uint64(v) | Value::DateTime(v) => v & FIFTY_SIX_BIT_MASK,
            _ => 0,
        }
    }

    /// Types with no literal syntax render as strings when compared against
    /// a string.
    pub fn has_no_literals(&self) -> bool {
        matches!(
            self,
            Value::Char(_) | Value::DateTime(_) | Value::Ip(_) | Value::Mac(_) | Value::Driver(_)
        )
    }

    pub fn append_as_string(&self, out: &mut String) {
        use fmt::Write;
        match self {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Char(c) => out.push(*c),
            Value::Int(i) => {
                let _ = write!(out, "{}", i);
            }
            Value::Uint(u) => {
                let _ = write!(out, "{}", u);
            }
            Value::Uint64(u) => {
                let _ = write!(out, "{}", u);
            }
            Value::DateTime(seconds) => {
                let _ = write!(out, "{}", format_datetime(*seconds));
            }
            Value::Float(v, decimals) => {
                let _ = write!(out, "{:.*}", *decimals as usize, v);
            }
            Value::StaticStr(s) => out.push_str(s),
            Value::Str(s) => out.push_str(s),
            Value::Driver(id) => {
                let _ = write!(out, "{}", id);
            }
            Value::Ip(ip) => {
                let _ = write!(out, "{}", ip);
            }
            Value::Mac(mac) => {
                let _ = write!(
                    out,
                    "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                    mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
                );
            }
            Value::Object(_) => out.push_str("{object}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = String::new();
        self.append_as_string(&mut text);
        f.write_str(&text)
    }
}

/// Render a seconds-since-epoch count as `YYYY-MM-DDThh:mm:ss`.
pub fn format_datetime(seconds: u64) -> String {
    match chrono::DateTime::from_timestamp(seconds as i64, 0) {
        Some(dt) => dt.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => String::from("1970-01-01T00:00:00"),
    }
}

/// Parse a `YYYY-MM-DDThh:mm:ss` string to seconds since the epoch.
pub fn parse_datetime(text: &str) -> Option<u64> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_display_honours_precision_hint() {
        assert_eq!(Value::float(1.5, 1).to_string(), "1.5");
        assert_eq!(Value::float(1.5, 3).to_string(), "1.500");
        // The hint is clamped to the display maximum.
        assert_eq!(Value::float(0.5, 40), Value::Float(0.5, MAX_FLOAT_DIGITS));
    }

    #[test]
    fn string_content_ignores_flavour() {
        assert_eq!(Value::StaticStr("abc").as_str(), Some("abc"));
        assert_eq!(Value::Str("abc".to_string()).as_str(), Some("abc"));
    }

    #[test]
    fn datetime_round_trips_through_text() {
        let seconds = parse_datetime("2023-06-15T12:30:45").unwrap();
        assert_eq!(format_datetime(seconds), "2023-06-15T12:30:45");
    }

    #[test]
    fn payload_is_masked_to_56_bits() {
        let v = Value::uint64(u64::MAX);
        assert_eq!(v.payload_56bit(), (1u64 << 56) - 1);
    }

    #[test]
    fn driver_and_network_values_render_canonically() {
        assert_eq!(Value::Driver(DriverId { board: 1, port: 3 }).to_string(), "1.3");
        assert_eq!(
            Value::Ip(Ipv4Addr::new(192, 168, 1, 10)).to_string(),
            "192.168.1.10"
        );
        assert_eq!(
            Value::Mac([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]).to_string(),
            "de:ad:be:ef:00:01"
        );
    }
}
