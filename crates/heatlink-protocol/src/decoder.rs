//! Schema-driven decoding of response frames.
//!
//! Record positions are offsets into the de-stuffed frame, header included,
//! so a record at position 3 reads the echoed request byte. Fields are
//! big-endian and signed; one-byte fields are sign-extended.
//!
//! Numeric fields are scaled by these rules:
//!
//! | scale          | result                   |
//! |----------------|--------------------------|
//! | `1`            | `Integer(raw)`           |
//! | `> 1`          | `Float(raw / scale)`     |
//! | `0 < s < 1`    | `Float(raw * scale)`     |
//! | `<= 0`, NaN    | field warning            |
//!
//! Floats are rounded to two decimals. A record that cannot be decoded
//! produces exactly one [`FieldWarning`] and never stops the others.

use tracing::{trace, warn};

use heatlink_core::error::{Error, Result};
use heatlink_core::types::{
    DataType, DecodedValue, FieldWarning, Reading, Readings, RecordDefinition, Request,
    ScheduleFormat, VERSION_REQUEST_NAME,
};

use crate::frame::{build_set_request, PAYLOAD_START};

/// Offset of the firmware version short in a version response.
const VERSION_OFFSET: usize = 4;

/// Quarter-hour values at or above this mean "no switching time".
const QUARTERS_PER_DAY: u8 = 96;

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Tolerance when checking a setting against its step.
const STEP_EPSILON: f64 = 1e-6;

/// Decode every record of a response frame.
pub fn decode(frame: &[u8], records: &[RecordDefinition]) -> Readings {
    let mut readings = Readings::new();
    for record in records {
        match decode_record(frame, record) {
            Ok(value) => {
                trace!(field = %record.name, value = %value, "decoded record");
                readings.values.insert(
                    record.name.clone(),
                    Reading {
                        value,
                        unit: record.unit.clone(),
                        data_type: record.data_type,
                    },
                );
            }
            Err(warning) => {
                warn!(field = %warning.field, reason = %warning.reason, "skipping record");
                readings.warnings.push(warning);
            }
        }
    }
    readings
}

/// Decode a single record.
pub fn decode_record(
    frame: &[u8],
    record: &RecordDefinition,
) -> std::result::Result<DecodedValue, FieldWarning> {
    let warning = |reason: String| FieldWarning {
        field: record.name.clone(),
        reason,
    };

    if record.length != 1 && record.length != 2 {
        return Err(warning(format!(
            "unsupported length {} (expected 1 or 2)",
            record.length
        )));
    }
    let bytes = frame.get(record.position..record.end()).ok_or_else(|| {
        warning(format!(
            "bytes {}..{} outside {}-byte frame",
            record.position,
            record.end(),
            frame.len()
        ))
    })?;

    if let Some(bit) = record.bit_position {
        if bit >= 8 {
            return Err(warning(format!("bit {bit} outside byte at {}", record.position)));
        }
        return Ok(DecodedValue::Boolean((bytes[0] >> bit) & 1 == 1));
    }

    if let Some(format) = record.schedule {
        return decode_schedule(format, bytes).map_err(warning);
    }

    let raw = match bytes {
        [b] => i64::from(*b as i8),
        _ => i64::from(i16::from_be_bytes([bytes[0], bytes[1]])),
    };
    scale_value(raw, record.scale).map_err(warning)
}

fn scale_value(raw: i64, scale: f64) -> std::result::Result<DecodedValue, String> {
    if !scale.is_finite() || scale <= 0.0 {
        return Err(format!("invalid scale {scale}"));
    }
    if scale == 1.0 {
        return Ok(DecodedValue::Integer(raw));
    }
    let value = if scale > 1.0 {
        raw as f64 / scale
    } else {
        raw as f64 * scale
    };
    Ok(DecodedValue::Float(round2(value)))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn decode_schedule(format: ScheduleFormat, bytes: &[u8]) -> std::result::Result<DecodedValue, String> {
    match (format, bytes) {
        (ScheduleFormat::TimeWindow, [start, end]) => Ok(DecodedValue::Schedule(format!(
            "{}-{}",
            quarter_to_time(*start),
            quarter_to_time(*end)
        ))),
        (ScheduleFormat::TimeWindow, _) => Err("time window needs a 2-byte field".into()),
        (ScheduleFormat::Weekdays, [mask]) => {
            let days: Vec<&str> = WEEKDAYS
                .iter()
                .enumerate()
                .filter(|(i, _)| *mask & (1u8 << *i) != 0)
                .map(|(_, day)| *day)
                .collect();
            let text = if days.is_empty() {
                "none".to_string()
            } else {
                days.join(",")
            };
            Ok(DecodedValue::Schedule(text))
        }
        (ScheduleFormat::Weekdays, _) => Err("weekday mask needs a 1-byte field".into()),
    }
}

fn quarter_to_time(quarters: u8) -> String {
    if quarters >= QUARTERS_PER_DAY {
        return "--:--".to_string();
    }
    format!("{:02}:{:02}", quarters / 4, (quarters % 4) * 15)
}

/// Extract the firmware version from a version response.
///
/// When `request` carries a record named `Version` its decoded value is
/// used; otherwise the unsigned big-endian short at offset 4 is read as
/// hundredths (`206` gives `"2.06"`).
pub fn parse_version(frame: &[u8], request: Option<&Request>) -> Result<String> {
    let record = request.and_then(|r| {
        r.record_definitions
            .iter()
            .find(|rec| rec.name.eq_ignore_ascii_case(VERSION_REQUEST_NAME))
    });

    if let Some(record) = record {
        let value = decode_record(frame, record)
            .map_err(|w| Error::Protocol(format!("cannot decode version: {w}")))?;
        return Ok(match value {
            DecodedValue::Float(v) => format!("{v:.2}"),
            other => other.to_string(),
        });
    }

    let bytes = frame
        .get(VERSION_OFFSET..VERSION_OFFSET + 2)
        .ok_or_else(|| Error::Protocol(format!("version frame too short ({} bytes)", frame.len())))?;
    let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
    Ok(format!("{}.{:02}", raw / 100, raw % 100))
}

/// Encode a setting value into the raw field bytes of `record`.
///
/// Only `Settings` records can be written. The value is checked against
/// the record's `min`, `max` and `step`, then scaled back to the raw
/// integer and laid out big-endian in `length` bytes.
pub fn encode_setting(record: &RecordDefinition, value: f64) -> Result<Vec<u8>> {
    if record.data_type != DataType::Settings {
        return Err(Error::InvalidParameter(format!(
            "{} is a {} value and cannot be written",
            record.name, record.data_type
        )));
    }
    if record.bit_position.is_some() || record.schedule.is_some() {
        return Err(Error::Unsupported(format!(
            "writing bit or schedule field {}",
            record.name
        )));
    }
    if !value.is_finite() {
        return Err(Error::InvalidParameter(format!("{value} is not a number")));
    }
    if let Some(min) = record.min {
        if value < min {
            return Err(Error::InvalidParameter(format!(
                "{} = {value} is below minimum {min}",
                record.name
            )));
        }
    }
    if let Some(max) = record.max {
        if value > max {
            return Err(Error::InvalidParameter(format!(
                "{} = {value} is above maximum {max}",
                record.name
            )));
        }
    }
    if let Some(step) = record.step.filter(|s| *s > 0.0) {
        let steps = (value - record.min.unwrap_or(0.0)) / step;
        if (steps - steps.round()).abs() > STEP_EPSILON {
            return Err(Error::InvalidParameter(format!(
                "{} = {value} is not a multiple of step {step}",
                record.name
            )));
        }
    }

    let scale = record.scale;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(Error::InvalidParameter(format!(
            "{} has invalid scale {scale}",
            record.name
        )));
    }
    let raw = if scale >= 1.0 { value * scale } else { value / scale }.round();

    match record.length {
        1 if (f64::from(i8::MIN)..=f64::from(i8::MAX)).contains(&raw) => {
            Ok(vec![(raw as i8) as u8])
        }
        2 if (f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&raw) => {
            Ok((raw as i16).to_be_bytes().to_vec())
        }
        1 | 2 => Err(Error::InvalidParameter(format!(
            "{} = {value} does not fit a {}-byte field",
            record.name, record.length
        ))),
        other => Err(Error::InvalidParameter(format!(
            "{} has unsupported length {other}",
            record.name
        ))),
    }
}

/// Build the SET message writing `value` to `record` of `request`.
///
/// The body mirrors the response layout: the request byte at offset 3,
/// then the encoded field at the record's `position`. Bytes in between are
/// zero. The message is only constructed, never sent.
pub fn build_setting_message(
    request: &Request,
    record: &RecordDefinition,
    value: f64,
) -> Result<Vec<u8>> {
    let field = encode_setting(record, value)?;
    let gap = record
        .position
        .checked_sub(PAYLOAD_START + 1)
        .ok_or_else(|| {
            Error::InvalidParameter(format!(
                "{} at position {} overlaps the request byte",
                record.name, record.position
            ))
        })?;
    let mut data = vec![0u8; gap];
    data.extend_from_slice(&field);
    Ok(build_set_request(request.request_byte, &data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::checksum;

    /// A de-stuffed response frame around `payload`.
    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut f = vec![0x01, 0x00, checksum(payload)];
        f.extend_from_slice(payload);
        f.extend_from_slice(&[0x10, 0x03]);
        f
    }

    #[test]
    fn single_byte_sensor_decodes_to_integer() {
        let f = [0x01, 0x00, 0x06, 0x05, 0x10, 0x03];
        let record = RecordDefinition::new("Value", 3, 1, DataType::Sensor);
        let readings = decode(&f, &[record]);
        assert_eq!(readings.get("Value").unwrap().value, DecodedValue::Integer(5));
        assert!(readings.warnings.is_empty());
    }

    #[test]
    fn two_byte_fields_are_signed_big_endian() {
        let f = frame(&[0xFB, 0x00, 0xD2, 0xFF, 0x38]);
        let records = [
            RecordDefinition::new("Flow", 4, 2, DataType::Sensor),
            RecordDefinition::new("Outside", 6, 2, DataType::Sensor),
            RecordDefinition::new("Low", 7, 1, DataType::Sensor),
        ];
        let readings = decode(&f, &records);
        assert_eq!(readings.get("Flow").unwrap().value, DecodedValue::Integer(210));
        assert_eq!(readings.get("Outside").unwrap().value, DecodedValue::Integer(-200));
        assert_eq!(readings.get("Low").unwrap().value, DecodedValue::Integer(0x38));
    }

    #[test]
    fn scale_rules() {
        let f = frame(&[0xFB, 0x00, 0xD2]);
        let at = |scale: f64| RecordDefinition::new("T", 4, 2, DataType::Sensor).with_scale(scale);

        assert_eq!(decode_record(&f, &at(1.0)), Ok(DecodedValue::Integer(210)));
        assert_eq!(decode_record(&f, &at(10.0)), Ok(DecodedValue::Float(21.0)));
        assert_eq!(decode_record(&f, &at(0.1)), Ok(DecodedValue::Float(21.0)));
        assert_eq!(decode_record(&f, &at(3.0)), Ok(DecodedValue::Float(70.0)));
        assert_eq!(decode_record(&f, &at(0.01)), Ok(DecodedValue::Float(2.1)));
        assert!(decode_record(&f, &at(0.0)).is_err());
        assert!(decode_record(&f, &at(-1.0)).is_err());
        assert!(decode_record(&f, &at(f64::NAN)).is_err());
    }

    #[test]
    fn floats_round_to_two_decimals() {
        let f = frame(&[0xFB, 0x00, 0x64]);
        let record = RecordDefinition::new("T", 4, 2, DataType::Sensor).with_scale(3.0);
        assert_eq!(decode_record(&f, &record), Ok(DecodedValue::Float(33.33)));
    }

    #[test]
    fn bit_flags_read_the_byte_at_position() {
        let f = frame(&[0xFA, 0x81, 0x02]);
        let bit = |pos: usize, len: usize, n: u8| {
            RecordDefinition::new("F", pos, len, DataType::Status).with_bit(n)
        };

        assert_eq!(decode_record(&f, &bit(4, 1, 0)), Ok(DecodedValue::Boolean(true)));
        assert_eq!(decode_record(&f, &bit(4, 1, 7)), Ok(DecodedValue::Boolean(true)));
        assert_eq!(decode_record(&f, &bit(4, 1, 1)), Ok(DecodedValue::Boolean(false)));
        assert_eq!(decode_record(&f, &bit(5, 1, 1)), Ok(DecodedValue::Boolean(true)));
        assert!(decode_record(&f, &bit(4, 1, 8)).is_err());
    }

    #[test]
    fn bit_flags_in_two_byte_field_use_first_byte() {
        // 0x81 at position 4, 0x02 at position 5
        let f = frame(&[0xFA, 0x81, 0x02]);
        let bit = |n: u8| RecordDefinition::new("F", 4, 2, DataType::Status).with_bit(n);

        assert_eq!(decode_record(&f, &bit(0)), Ok(DecodedValue::Boolean(true)));
        assert_eq!(decode_record(&f, &bit(1)), Ok(DecodedValue::Boolean(false)));
        assert_eq!(decode_record(&f, &bit(7)), Ok(DecodedValue::Boolean(true)));
        assert!(decode_record(&f, &bit(8)).is_err());

        let f = vec![0x01, 0x00, 0x00, 0xFB, 0x01, 0x00, 0x10, 0x03];
        assert_eq!(decode_record(&f, &bit(0)), Ok(DecodedValue::Boolean(true)));
    }

    #[test]
    fn time_window_schedule() {
        let f = frame(&[0xEC, 24, 90, 0x80, 96]);
        let window = |pos| {
            RecordDefinition::new("W", pos, 2, DataType::Settings)
                .with_schedule(ScheduleFormat::TimeWindow)
        };
        assert_eq!(
            decode_record(&f, &window(4)),
            Ok(DecodedValue::Schedule("06:00-22:30".into()))
        );
        assert_eq!(
            decode_record(&f, &window(6)),
            Ok(DecodedValue::Schedule("--:-----:--".into()))
        );
    }

    #[test]
    fn weekday_schedule() {
        let f = frame(&[0xEC, 0b0110_0001, 0x00]);
        let days = |pos| {
            RecordDefinition::new("D", pos, 1, DataType::Settings)
                .with_schedule(ScheduleFormat::Weekdays)
        };
        assert_eq!(
            decode_record(&f, &days(4)),
            Ok(DecodedValue::Schedule("Mon,Sat,Sun".into()))
        );
        assert_eq!(
            decode_record(&f, &days(5)),
            Ok(DecodedValue::Schedule("none".into()))
        );
    }

    #[test]
    fn out_of_bounds_field_warns_once_and_decoding_continues() {
        let f = frame(&[0xFB, 0x07]);
        let records = [
            RecordDefinition::new("Good", 4, 1, DataType::Sensor),
            RecordDefinition::new("Beyond", 6, 2, DataType::Sensor),
            RecordDefinition::new("Echo", 3, 1, DataType::Sensor),
        ];
        let readings = decode(&f, &records);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings.get("Good").unwrap().value, DecodedValue::Integer(7));
        assert!(readings.get("Echo").is_some());
        assert_eq!(readings.warnings.len(), 1);
        assert_eq!(readings.warnings[0].field, "Beyond");
    }

    #[test]
    fn unsupported_length_warns() {
        let f = frame(&[0xFB, 0x01, 0x02, 0x03, 0x04]);
        let record = RecordDefinition::new("Wide", 4, 4, DataType::Sensor);
        let readings = decode(&f, &[record]);
        assert!(readings.is_empty());
        assert_eq!(readings.warnings.len(), 1);
    }

    #[test]
    fn readings_carry_unit_and_type() {
        let f = frame(&[0xFB, 0x00, 0xD2]);
        let record = RecordDefinition::new("Outside", 4, 2, DataType::Sensor)
            .with_scale(10.0)
            .with_unit("°C");
        let readings = decode(&f, &[record]);
        let reading = readings.get("Outside").unwrap();
        assert_eq!(reading.data_type, DataType::Sensor);
        assert_eq!(reading.to_string(), "21 °C");
    }

    #[test]
    fn version_from_raw_short() {
        let f = frame(&[0xFD, 0x00, 0xCE]);
        assert_eq!(parse_version(&f, None).unwrap(), "2.06");

        let f = frame(&[0xFD, 0x01, 0x99]);
        assert_eq!(parse_version(&f, None).unwrap(), "4.09");

        // high bit set is a large version, not a negative one
        let f = frame(&[0xFD, 0xFF, 0xFB]);
        assert_eq!(parse_version(&f, None).unwrap(), "655.31");
    }

    #[test]
    fn version_from_schema_record() {
        let request = Request::new("Version", "", 0xFD).with_record(
            RecordDefinition::new("Version", 4, 2, DataType::Sensor).with_scale(100.0),
        );
        let f = frame(&[0xFD, 0x00, 0xD2]);
        assert_eq!(parse_version(&f, Some(&request)).unwrap(), "2.10");
    }

    #[test]
    fn version_frame_too_short() {
        assert!(matches!(
            parse_version(&[0x01, 0x00, 0x01, 0x10, 0x03], None),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn encode_setting_inverts_scale() {
        let record = RecordDefinition::new("Comfort", 4, 2, DataType::Settings)
            .with_scale(10.0)
            .with_range(10.0, 30.0, 0.5);
        assert_eq!(encode_setting(&record, 21.5).unwrap(), vec![0x00, 0xD7]);

        let record = RecordDefinition::new("Hyst", 4, 1, DataType::Settings).with_scale(0.1);
        assert_eq!(encode_setting(&record, 1.2).unwrap(), vec![0x0C]);

        let record = RecordDefinition::new("Offset", 4, 1, DataType::Settings);
        assert_eq!(encode_setting(&record, -3.0).unwrap(), vec![0xFD]);
    }

    #[test]
    fn setting_message_places_field_at_position() {
        let first = RecordDefinition::new("Comfort", 4, 2, DataType::Settings).with_scale(10.0);
        let second = RecordDefinition::new("Eco", 6, 2, DataType::Settings).with_scale(10.0);
        let request = Request::new("Settings", "", 0x0A)
            .with_record(first.clone())
            .with_record(second.clone());

        assert_eq!(
            build_setting_message(&request, &first, 21.5).unwrap(),
            build_set_request(0x0A, &[0x00, 0xD7])
        );
        assert_eq!(
            build_setting_message(&request, &second, 18.0).unwrap(),
            build_set_request(0x0A, &[0x00, 0x00, 0x00, 0xB4])
        );

        let overlapping = RecordDefinition::new("Echo", 3, 1, DataType::Settings);
        assert!(matches!(
            build_setting_message(&request, &overlapping, 1.0),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn encode_setting_rejects_invalid_values() {
        let record = RecordDefinition::new("Comfort", 4, 2, DataType::Settings)
            .with_scale(10.0)
            .with_range(10.0, 30.0, 0.5);
        assert!(matches!(encode_setting(&record, 9.5), Err(Error::InvalidParameter(_))));
        assert!(matches!(encode_setting(&record, 30.5), Err(Error::InvalidParameter(_))));
        assert!(matches!(encode_setting(&record, 21.2), Err(Error::InvalidParameter(_))));

        let sensor = RecordDefinition::new("Outside", 4, 2, DataType::Sensor);
        assert!(matches!(encode_setting(&sensor, 1.0), Err(Error::InvalidParameter(_))));

        let small = RecordDefinition::new("Small", 4, 1, DataType::Settings);
        assert!(matches!(encode_setting(&small, 200.0), Err(Error::InvalidParameter(_))));

        let flag = RecordDefinition::new("Flag", 4, 1, DataType::Settings).with_bit(0);
        assert!(matches!(encode_setting(&flag, 1.0), Err(Error::Unsupported(_))));
    }
}
