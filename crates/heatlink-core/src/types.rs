//! Core types used throughout heatlink.
//!
//! A [`Request`] identifies one query to the heat pump and carries the
//! ordered [`RecordDefinition`]s that describe its response payload. Both
//! are loaded once from schema data and never mutated afterwards.
//!
//! Decoding a response produces [`Readings`]: named [`Reading`]s plus any
//! per-field [`FieldWarning`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Name of the special firmware-version request (matched case-insensitively).
pub const VERSION_REQUEST_NAME: &str = "Version";

/// Classification of a record, used to group requests at the caller level.
///
/// The data type never changes decoding arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Measured values (temperatures, pressures, flow rates).
    Sensor,
    /// Operating state flags (pumps, compressor, heating stages).
    Status,
    /// User-adjustable parameters.
    Settings,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Sensor => "Sensor",
            DataType::Status => "Status",
            DataType::Settings => "Settings",
        };
        write!(f, "{s}")
    }
}

/// Error returned when a string cannot be parsed into a [`DataType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDataTypeError(String);

impl fmt::Display for ParseDataTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown data type: {}", self.0)
    }
}

impl std::error::Error for ParseDataTypeError {}

impl FromStr for DataType {
    type Err = ParseDataTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sensor" | "sensors" => Ok(DataType::Sensor),
            "status" => Ok(DataType::Status),
            "settings" | "setting" => Ok(DataType::Settings),
            _ => Err(ParseDataTypeError(s.to_string())),
        }
    }
}

/// Encoding of a schedule (timer program) field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFormat {
    /// Two bytes: start and end of a switching window, each in quarter-hours
    /// since midnight. Values of 96 and above mean "not set".
    TimeWindow,
    /// One byte: bit 0 = Monday through bit 6 = Sunday.
    Weekdays,
}

/// Describes one field inside a response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDefinition {
    /// Unique name of the value within its request.
    pub name: String,
    /// Byte offset into the (de-stuffed) response frame.
    pub position: usize,
    /// Field width in bytes, 1 or 2.
    pub length: usize,
    /// Scale applied to the raw integer (see the decoder for the rules).
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Grouping class of the value.
    pub data_type: DataType,
    /// Lowest permitted value when writing a setting.
    #[serde(default)]
    pub min: Option<f64>,
    /// Highest permitted value when writing a setting.
    #[serde(default)]
    pub max: Option<f64>,
    /// Increment in which a setting can be changed.
    #[serde(default)]
    pub step: Option<f64>,
    /// When set, the field is a single bit of the byte at `position`
    /// (0 = least significant, at most 7).
    #[serde(default)]
    pub bit_position: Option<u8>,
    /// Display unit, e.g. `"°C"`.
    #[serde(default)]
    pub unit: Option<String>,
    /// When set, the field is a timer program rather than a number.
    #[serde(default)]
    pub schedule: Option<ScheduleFormat>,
}

fn default_scale() -> f64 {
    1.0
}

impl RecordDefinition {
    /// Create a plain numeric record with scale 1 and no optional attributes.
    pub fn new(name: &str, position: usize, length: usize, data_type: DataType) -> Self {
        RecordDefinition {
            name: name.to_string(),
            position,
            length,
            scale: 1.0,
            data_type,
            min: None,
            max: None,
            step: None,
            bit_position: None,
            unit: None,
            schedule: None,
        }
    }

    /// Set the scale.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Set the display unit.
    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    /// Turn the record into a single-bit flag.
    pub fn with_bit(mut self, bit_position: u8) -> Self {
        self.bit_position = Some(bit_position);
        self
    }

    /// Set the permitted range and step for a writable setting.
    pub fn with_range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self.step = Some(step);
        self
    }

    /// Decode the field as a timer program.
    pub fn with_schedule(mut self, format: ScheduleFormat) -> Self {
        self.schedule = Some(format);
        self
    }

    /// One past the last byte this record reads.
    pub fn end(&self) -> usize {
        self.position.saturating_add(self.length)
    }
}

/// Identifies one query to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Unique key of the request.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Byte identifying the query on the wire. Schema files may write it as
    /// a number or as a hex string such as `"0xFD"`.
    #[serde(deserialize_with = "deserialize_byte")]
    pub request_byte: u8,
    /// Fields decoded from this request's response, in payload order.
    #[serde(default, alias = "records")]
    pub record_definitions: Vec<RecordDefinition>,
}

impl Request {
    /// Create a request without record definitions.
    pub fn new(name: &str, description: &str, request_byte: u8) -> Self {
        Request {
            name: name.to_string(),
            description: description.to_string(),
            request_byte,
            record_definitions: Vec::new(),
        }
    }

    /// Append a record definition.
    pub fn with_record(mut self, record: RecordDefinition) -> Self {
        self.record_definitions.push(record);
        self
    }

    /// Whether this is the special firmware-version request.
    pub fn is_version(&self) -> bool {
        self.name.eq_ignore_ascii_case(VERSION_REQUEST_NAME)
    }

    /// Whether any record of this request has the given data type.
    pub fn has_data_type(&self, data_type: DataType) -> bool {
        self.record_definitions
            .iter()
            .any(|r| r.data_type == data_type)
    }

    /// Find a record by name.
    pub fn record(&self, name: &str) -> Option<&RecordDefinition> {
        self.record_definitions.iter().find(|r| r.name == name)
    }
}

fn deserialize_byte<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ByteRepr {
        Number(u8),
        Text(String),
    }

    match ByteRepr::deserialize(deserializer)? {
        ByteRepr::Number(n) => Ok(n),
        ByteRepr::Text(s) => parse_hex_byte(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a byte written as `"0xFD"`, `"FD"` or decimal `"253"`.
pub fn parse_hex_byte(s: &str) -> std::result::Result<u8, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u8::from_str_radix(hex, 16).map_err(|e| format!("invalid hex byte {s:?}: {e}"));
    }
    s.parse::<u8>()
        .or_else(|_| u8::from_str_radix(s, 16))
        .map_err(|e| format!("invalid byte {s:?}: {e}"))
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    /// Unscaled integer (scale 1).
    Integer(i64),
    /// Scaled value, rounded to two decimals.
    Float(f64),
    /// Single-bit flag.
    Boolean(bool),
    /// Formatted timer program.
    Schedule(String),
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Integer(v) => write!(f, "{v}"),
            DecodedValue::Float(v) => write!(f, "{v}"),
            DecodedValue::Boolean(v) => write!(f, "{}", if *v { "on" } else { "off" }),
            DecodedValue::Schedule(s) => write!(f, "{s}"),
        }
    }
}

/// One decoded value together with its unit and classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: DecodedValue,
    pub unit: Option<String>,
    pub data_type: DataType,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit.as_deref() {
            Some(unit) if !unit.is_empty() => write!(f, "{} {unit}", self.value),
            _ => write!(f, "{}", self.value),
        }
    }
}

/// A record that could not be decoded from a payload.
///
/// Warnings are localized: the remaining records of the same payload are
/// still decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWarning {
    /// Name of the offending record.
    pub field: String,
    /// What was wrong with it.
    pub reason: String,
}

impl fmt::Display for FieldWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field {}: {}", self.field, self.reason)
    }
}

/// The decoded values of one or more responses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings {
    pub values: BTreeMap<String, Reading>,
    pub warnings: Vec<FieldWarning>,
}

impl Readings {
    /// An empty result, as returned for a request the device never answered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value by record name.
    pub fn get(&self, name: &str) -> Option<&Reading> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge another result into this one; later values win on name clashes.
    pub fn extend(&mut self, other: Readings) {
        self.values.extend(other.values);
        self.warnings.extend(other.warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_from_str() {
        assert_eq!("sensor".parse::<DataType>().unwrap(), DataType::Sensor);
        assert_eq!("Status".parse::<DataType>().unwrap(), DataType::Status);
        assert_eq!("SETTINGS".parse::<DataType>().unwrap(), DataType::Settings);
        assert!("bogus".parse::<DataType>().is_err());
    }

    #[test]
    fn version_request_matches_case_insensitively() {
        assert!(Request::new("version", "", 0xFD).is_version());
        assert!(Request::new("VERSION", "", 0xFD).is_version());
        assert!(!Request::new("Versions", "", 0xFD).is_version());
    }

    #[test]
    fn request_groups_by_data_type() {
        let req = Request::new("Sensors", "", 0xFB)
            .with_record(RecordDefinition::new("OutsideTemp", 4, 2, DataType::Sensor))
            .with_record(RecordDefinition::new("Pump", 6, 1, DataType::Status).with_bit(0));
        assert!(req.has_data_type(DataType::Sensor));
        assert!(req.has_data_type(DataType::Status));
        assert!(!req.has_data_type(DataType::Settings));
        assert_eq!(req.record("Pump").unwrap().bit_position, Some(0));
    }

    #[test]
    fn request_deserializes_hex_request_byte() {
        let json = r#"{
            "name": "Version",
            "request_byte": "0xFD",
            "record_definitions": [
                { "name": "Version", "position": 4, "length": 2, "scale": 0.01, "data_type": "Sensor" }
            ]
        }"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(req.request_byte, 0xFD);
        assert_eq!(req.description, "");
        assert_eq!(req.record_definitions[0].scale, 0.01);
        assert_eq!(req.record_definitions[0].bit_position, None);
    }

    #[test]
    fn request_deserializes_numeric_request_byte() {
        let json = r#"{ "name": "Sensors", "request_byte": 251 }"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(req.request_byte, 0xFB);
        assert!(req.record_definitions.is_empty());
    }

    #[test]
    fn record_defaults_scale_to_one() {
        let json = r#"{ "name": "T", "position": 3, "length": 1, "data_type": "Sensor",
                        "schedule": "weekdays" }"#;
        let rec: RecordDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(rec.scale, 1.0);
        assert_eq!(rec.schedule, Some(ScheduleFormat::Weekdays));
        assert_eq!(rec.end(), 4);
    }

    #[test]
    fn parse_hex_byte_forms() {
        assert_eq!(parse_hex_byte("0xFD"), Ok(0xFD));
        assert_eq!(parse_hex_byte("0Xfb"), Ok(0xFB));
        assert_eq!(parse_hex_byte("253"), Ok(253));
        assert_eq!(parse_hex_byte("fc"), Ok(0xFC));
        assert!(parse_hex_byte("0x1FF").is_err());
    }

    #[test]
    fn reading_display_with_unit() {
        let r = Reading {
            value: DecodedValue::Float(21.5),
            unit: Some("°C".into()),
            data_type: DataType::Sensor,
        };
        assert_eq!(r.to_string(), "21.5 °C");

        let r = Reading {
            value: DecodedValue::Boolean(true),
            unit: None,
            data_type: DataType::Status,
        };
        assert_eq!(r.to_string(), "on");
    }

    #[test]
    fn readings_extend_merges_values_and_warnings() {
        let mut a = Readings::new();
        a.values.insert(
            "A".into(),
            Reading {
                value: DecodedValue::Integer(1),
                unit: None,
                data_type: DataType::Sensor,
            },
        );
        let mut b = Readings::new();
        b.warnings.push(FieldWarning {
            field: "B".into(),
            reason: "out of bounds".into(),
        });
        a.extend(b);
        assert_eq!(a.len(), 1);
        assert_eq!(a.warnings.len(), 1);
        assert_eq!(a.warnings[0].to_string(), "field B: out of bounds");
    }
}
