//! Built-in cluster handlers and the attribute mapping table.

use serde_json::{Map, Value, json};

use super::EncodingError;
use super::zcl::{DataType, ZclValue};

pub const BASIC: u16 = 0x0000;
pub const POWER_CONFIG: u16 = 0x0001;
pub const ON_OFF: u16 = 0x0006;
pub const LEVEL_CONTROL: u16 = 0x0008;
pub const COLOR_CONTROL: u16 = 0x0300;
pub const ILLUMINANCE: u16 = 0x0400;
pub const TEMPERATURE: u16 = 0x0402;
pub const PRESSURE: u16 = 0x0403;
pub const HUMIDITY: u16 = 0x0405;
pub const OCCUPANCY: u16 = 0x0406;

/// Basic cluster attributes read during the interview.
pub const BASIC_MANUFACTURER: u16 = 0x0004;
pub const BASIC_MODEL: u16 = 0x0005;

/// How a raw value maps to its JSON form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `raw * multiplier / divisor + offset`
    Numeric,
    /// `"ON"` / `"OFF"`
    OnOff,
    Bool,
    /// Bit 0 of a bitmap.
    Occupancy,
    Text,
}

/// One row of the mapping table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttributeSpec {
    pub cluster: u16,
    pub attribute: u16,
    pub field: &'static str,
    pub data_type: DataType,
    pub multiplier: i64,
    pub divisor: i64,
    pub offset: f64,
    pub writable: bool,
    pub kind: ValueKind,
}

const fn spec(
    cluster: u16,
    attribute: u16,
    field: &'static str,
    data_type: DataType,
    kind: ValueKind,
) -> AttributeSpec {
    AttributeSpec {
        cluster,
        attribute,
        field,
        data_type,
        multiplier: 1,
        divisor: 1,
        offset: 0.0,
        writable: false,
        kind,
    }
}

const fn scaled(mut s: AttributeSpec, multiplier: i64, divisor: i64) -> AttributeSpec {
    s.multiplier = multiplier;
    s.divisor = divisor;
    s
}

const fn writable(mut s: AttributeSpec) -> AttributeSpec {
    s.writable = true;
    s
}

use ValueKind::{Bool, Numeric, OnOff, Occupancy, Text};

const BASIC_ATTRIBUTES: &[AttributeSpec] = &[
    spec(BASIC, BASIC_MANUFACTURER, "manufacturer", DataType::String, Text),
    spec(BASIC, BASIC_MODEL, "model", DataType::String, Text),
    spec(BASIC, 0x0007, "power_source", DataType::Enum8, Numeric),
    writable(spec(BASIC, 0x0010, "location", DataType::String, Text)),
    spec(BASIC, 0x4000, "sw_build_id", DataType::String, Text),
];

const POWER_CONFIG_ATTRIBUTES: &[AttributeSpec] = &[
    // 100 mV units
    scaled(spec(POWER_CONFIG, 0x0020, "voltage", DataType::Uint8, Numeric), 100, 1),
    // half-percent units
    scaled(spec(POWER_CONFIG, 0x0021, "battery", DataType::Uint8, Numeric), 1, 2),
];

const ON_OFF_ATTRIBUTES: &[AttributeSpec] =
    &[writable(spec(ON_OFF, 0x0000, "state", DataType::Bool, OnOff))];

const LEVEL_ATTRIBUTES: &[AttributeSpec] =
    &[writable(spec(LEVEL_CONTROL, 0x0000, "brightness", DataType::Uint8, Numeric))];

const COLOR_ATTRIBUTES: &[AttributeSpec] =
    &[writable(spec(COLOR_CONTROL, 0x0007, "color_temp", DataType::Uint16, Numeric))];

const ILLUMINANCE_ATTRIBUTES: &[AttributeSpec] =
    &[spec(ILLUMINANCE, 0x0000, "illuminance", DataType::Uint16, Numeric)];

const TEMPERATURE_ATTRIBUTES: &[AttributeSpec] =
    &[scaled(spec(TEMPERATURE, 0x0000, "temperature", DataType::Int16, Numeric), 1, 100)];

const PRESSURE_ATTRIBUTES: &[AttributeSpec] =
    &[spec(PRESSURE, 0x0000, "pressure", DataType::Int16, Numeric)];

const HUMIDITY_ATTRIBUTES: &[AttributeSpec] =
    &[scaled(spec(HUMIDITY, 0x0000, "humidity", DataType::Uint16, Numeric), 1, 100)];

const OCCUPANCY_ATTRIBUTES: &[AttributeSpec] =
    &[spec(OCCUPANCY, 0x0000, "occupancy", DataType::Bitmap8, Occupancy)];

/// On/Off cluster commands.
pub mod on_off {
    pub const OFF: u8 = 0x00;
    pub const ON: u8 = 0x01;
    pub const TOGGLE: u8 = 0x02;
}

/// Move to level (with on/off).
pub const MOVE_TO_LEVEL_WITH_ON_OFF: u8 = 0x04;
/// Move to colour temperature.
pub const MOVE_TO_COLOR_TEMP: u8 = 0x0A;

/// How a field is changed on the device.
#[derive(Debug, Clone, PartialEq)]
pub enum SetRequest {
    /// Cluster-specific command.
    Command { command: u8, payload: Vec<u8> },
    /// Global write attributes.
    Write { attribute: u16, value: ZclValue },
}

/// Handler for one cluster, selected by cluster id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHandler {
    Basic,
    PowerConfig,
    OnOff,
    Level,
    Color,
    Illuminance,
    Temperature,
    Pressure,
    Humidity,
    Occupancy,
    /// Any cluster without a mapping.
    Raw(u16),
}

impl ClusterHandler {
    /// Every handler with a mapping table.
    pub const BUILT_IN: [ClusterHandler; 10] = [
        Self::Basic,
        Self::PowerConfig,
        Self::OnOff,
        Self::Level,
        Self::Color,
        Self::Illuminance,
        Self::Temperature,
        Self::Pressure,
        Self::Humidity,
        Self::Occupancy,
    ];

    pub fn for_cluster(cluster: u16) -> Self {
        match cluster {
            BASIC => Self::Basic,
            POWER_CONFIG => Self::PowerConfig,
            ON_OFF => Self::OnOff,
            LEVEL_CONTROL => Self::Level,
            COLOR_CONTROL => Self::Color,
            ILLUMINANCE => Self::Illuminance,
            TEMPERATURE => Self::Temperature,
            PRESSURE => Self::Pressure,
            HUMIDITY => Self::Humidity,
            OCCUPANCY => Self::Occupancy,
            other => Self::Raw(other),
        }
    }

    pub fn cluster_id(self) -> u16 {
        match self {
            Self::Basic => BASIC,
            Self::PowerConfig => POWER_CONFIG,
            Self::OnOff => ON_OFF,
            Self::Level => LEVEL_CONTROL,
            Self::Color => COLOR_CONTROL,
            Self::Illuminance => ILLUMINANCE,
            Self::Temperature => TEMPERATURE,
            Self::Pressure => PRESSURE,
            Self::Humidity => HUMIDITY,
            Self::Occupancy => OCCUPANCY,
            Self::Raw(id) => id,
        }
    }

    pub fn attributes(self) -> &'static [AttributeSpec] {
        match self {
            Self::Basic => BASIC_ATTRIBUTES,
            Self::PowerConfig => POWER_CONFIG_ATTRIBUTES,
            Self::OnOff => ON_OFF_ATTRIBUTES,
            Self::Level => LEVEL_ATTRIBUTES,
            Self::Color => COLOR_ATTRIBUTES,
            Self::Illuminance => ILLUMINANCE_ATTRIBUTES,
            Self::Temperature => TEMPERATURE_ATTRIBUTES,
            Self::Pressure => PRESSURE_ATTRIBUTES,
            Self::Humidity => HUMIDITY_ATTRIBUTES,
            Self::Occupancy => OCCUPANCY_ATTRIBUTES,
            Self::Raw(_) => &[],
        }
    }

    pub fn attribute(self, attribute: u16) -> Option<&'static AttributeSpec> {
        self.attributes().iter().find(|s| s.attribute == attribute)
    }

    /// Map a reported attribute to its state field.
    ///
    /// Unmapped attributes become `"<cluster>_<attribute>": "<hex>"`.
    pub fn decode_attribute(self, attribute: u16, value: &ZclValue) -> (String, Value) {
        match self.attribute(attribute).and_then(|s| to_json(s, value).map(|v| (s, v))) {
            Some((spec, json)) => (spec.field.to_string(), json),
            None => (
                format!("{:04x}_{:04x}", self.cluster_id(), attribute),
                Value::String(value.to_hex()),
            ),
        }
    }

    /// Map a cluster-specific command sent by a device (a remote, a button).
    pub fn decode_command(self, command: u8, payload: &[u8]) -> Map<String, Value> {
        let mut fields = Map::new();
        let action = match (self, command) {
            (Self::OnOff, on_off::OFF) => Some("off"),
            (Self::OnOff, on_off::ON) => Some("on"),
            (Self::OnOff, on_off::TOGGLE) => Some("toggle"),
            (Self::Level, MOVE_TO_LEVEL_WITH_ON_OFF) => {
                if let Some(level) = payload.first() {
                    fields.insert("action_level".to_string(), json!(level));
                }
                Some("brightness_move_to_level")
            }
            _ => None,
        };
        match action {
            Some(action) => {
                fields.insert("action".to_string(), json!(action));
            }
            None => {
                let hex: String = payload.iter().map(|b| format!("{:02x}", b)).collect();
                fields.insert(
                    format!("{:04x}_cmd_{:02x}", self.cluster_id(), command),
                    Value::String(hex),
                );
            }
        }
        fields
    }

    /// Build the request that sets `spec.field` to `value`.
    pub fn encode_set(
        self,
        spec: &AttributeSpec,
        value: &Value,
    ) -> Result<SetRequest, EncodingError> {
        if !spec.writable {
            return Err(EncodingError::ReadOnly(spec.field.to_string()));
        }
        match self {
            Self::OnOff => {
                let command = match value {
                    Value::String(s) if s.eq_ignore_ascii_case("on") => on_off::ON,
                    Value::String(s) if s.eq_ignore_ascii_case("off") => on_off::OFF,
                    Value::String(s) if s.eq_ignore_ascii_case("toggle") => on_off::TOGGLE,
                    Value::Bool(true) => on_off::ON,
                    Value::Bool(false) => on_off::OFF,
                    other => {
                        return Err(invalid(spec, format!("expected ON, OFF or TOGGLE, got {}", other)));
                    }
                };
                Ok(SetRequest::Command {
                    command,
                    payload: Vec::new(),
                })
            }
            Self::Level => {
                // 0xFF is reserved
                let level = integer_in(spec, value, 0, 254)?;
                let mut payload = vec![level as u8];
                payload.extend_from_slice(&0u16.to_le_bytes());
                Ok(SetRequest::Command {
                    command: MOVE_TO_LEVEL_WITH_ON_OFF,
                    payload,
                })
            }
            Self::Color => {
                let mireds = integer_in(spec, value, 1, 0xFEFF)?;
                let mut payload = (mireds as u16).to_le_bytes().to_vec();
                payload.extend_from_slice(&0u16.to_le_bytes());
                Ok(SetRequest::Command {
                    command: MOVE_TO_COLOR_TEMP,
                    payload,
                })
            }
            _ => Ok(SetRequest::Write {
                attribute: spec.attribute,
                value: from_json(spec, value)?,
            }),
        }
    }
}

/// Find the built-in mapping for a state field.
pub fn find_field(field: &str) -> Option<(ClusterHandler, &'static AttributeSpec)> {
    ClusterHandler::BUILT_IN.iter().find_map(|handler| {
        handler
            .attributes()
            .iter()
            .find(|s| s.field == field)
            .map(|s| (*handler, s))
    })
}

/// Raw value to JSON. `None` when the value does not fit the mapping.
pub fn to_json(spec: &AttributeSpec, value: &ZclValue) -> Option<Value> {
    match spec.kind {
        ValueKind::Text => match value {
            ZclValue::String(s) => Some(Value::String(s.clone())),
            _ => None,
        },
        ValueKind::OnOff => value
            .as_f64()
            .map(|v| Value::String(if v != 0.0 { "ON" } else { "OFF" }.to_string())),
        ValueKind::Bool => value.as_f64().map(|v| Value::Bool(v != 0.0)),
        ValueKind::Occupancy => value.as_f64().map(|v| Value::Bool((v as u64) & 0x01 != 0)),
        ValueKind::Numeric => {
            let raw = value.as_f64()?;
            let scaled = raw * spec.multiplier as f64 / spec.divisor as f64 + spec.offset;
            if spec.divisor == 1 && scaled.fract() == 0.0 && scaled.abs() < i64::MAX as f64 {
                Some(json!(scaled as i64))
            } else {
                serde_json::Number::from_f64(scaled).map(Value::Number)
            }
        }
    }
}

/// JSON to raw value, applying the inverse scale and checking the range.
pub fn from_json(spec: &AttributeSpec, value: &Value) -> Result<ZclValue, EncodingError> {
    match spec.kind {
        ValueKind::Text => match value {
            Value::String(s) if s.len() < u8::MAX as usize => Ok(ZclValue::String(s.clone())),
            Value::String(_) => Err(invalid(spec, "string longer than 254 bytes")),
            other => Err(invalid(spec, format!("expected a string, got {}", other))),
        },
        ValueKind::OnOff => match value {
            Value::String(s) if s.eq_ignore_ascii_case("on") => Ok(ZclValue::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("off") => Ok(ZclValue::Bool(false)),
            other => Err(invalid(spec, format!("expected ON or OFF, got {}", other))),
        },
        ValueKind::Bool | ValueKind::Occupancy => match value {
            Value::Bool(b) => {
                ZclValue::from_integer(spec.data_type, *b as i64).ok_or_else(|| invalid(spec, "unsupported type"))
            }
            other => Err(invalid(spec, format!("expected a boolean, got {}", other))),
        },
        ValueKind::Numeric => {
            let number = value
                .as_f64()
                .ok_or_else(|| invalid(spec, format!("expected a number, got {}", value)))?;
            let exact = (number - spec.offset) * spec.divisor as f64 / spec.multiplier as f64;
            let raw = exact.round();
            if spec.data_type == DataType::Float32 {
                return Ok(ZclValue::F32(raw as f32));
            }
            // Tolerance absorbs decimal inputs like 0.29 that scale to 28.999...
            if (exact - raw).abs() > 1e-9 * exact.abs().max(1.0) {
                return Err(invalid(
                    spec,
                    format!("{} is not a multiple of {}", number, scale_bound(spec, 1) - spec.offset),
                ));
            }
            let (min, max) = spec
                .data_type
                .range()
                .ok_or_else(|| invalid(spec, "unsupported type"))?;
            if !raw.is_finite() || raw < min as f64 || raw > max as f64 {
                return Err(EncodingError::OutOfRange {
                    field: spec.field.to_string(),
                    value: number,
                    min: scale_bound(spec, min),
                    max: scale_bound(spec, max),
                });
            }
            ZclValue::from_integer(spec.data_type, raw as i64)
                .ok_or_else(|| invalid(spec, "unsupported type"))
        }
    }
}

fn scale_bound(spec: &AttributeSpec, raw: i64) -> f64 {
    raw as f64 * spec.multiplier as f64 / spec.divisor as f64 + spec.offset
}

fn integer_in(spec: &AttributeSpec, value: &Value, min: i64, max: i64) -> Result<i64, EncodingError> {
    let number = value
        .as_f64()
        .ok_or_else(|| invalid(spec, format!("expected a number, got {}", value)))?;
    if number.fract() != 0.0 || number < min as f64 || number > max as f64 {
        return Err(EncodingError::OutOfRange {
            field: spec.field.to_string(),
            value: number,
            min: min as f64,
            max: max as f64,
        });
    }
    Ok(number as i64)
}

fn invalid(spec: &AttributeSpec, message: impl Into<String>) -> EncodingError {
    EncodingError::InvalidValue {
        field: spec.field.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::zcl::{decode_report_attributes, encode_report_attributes};

    #[test]
    fn test_temperature_scaling() {
        let handler = ClusterHandler::for_cluster(TEMPERATURE);
        assert_eq!(
            handler.decode_attribute(0x0000, &ZclValue::I16(2150)),
            ("temperature".to_string(), json!(21.5))
        );
        let (_, spec) = find_field("temperature").unwrap();
        assert_eq!(from_json(spec, &json!(21.5)).unwrap(), ZclValue::I16(2150));
        assert_eq!(from_json(spec, &json!(-0.5)).unwrap(), ZclValue::I16(-50));
    }

    #[test]
    fn test_integer_fields_stay_integers() {
        let handler = ClusterHandler::PowerConfig;
        assert_eq!(
            handler.decode_attribute(0x0020, &ZclValue::U8(30)),
            ("voltage".to_string(), json!(3000))
        );
        assert_eq!(
            handler.decode_attribute(0x0021, &ZclValue::U8(199)),
            ("battery".to_string(), json!(99.5))
        );
        assert_eq!(
            ClusterHandler::Illuminance.decode_attribute(0x0000, &ZclValue::U16(500)),
            ("illuminance".to_string(), json!(500))
        );
    }

    #[test]
    fn test_on_off_and_occupancy() {
        assert_eq!(
            ClusterHandler::OnOff.decode_attribute(0, &ZclValue::Bool(true)).1,
            json!("ON")
        );
        assert_eq!(
            ClusterHandler::Occupancy.decode_attribute(0, &ZclValue::Bitmap8(0x03)).1,
            json!(true)
        );
    }

    #[test]
    fn test_unknown_attribute_falls_back_to_raw() {
        assert_eq!(
            ClusterHandler::for_cluster(0xfc00).decode_attribute(0x0012, &ZclValue::U16(0xabcd)),
            ("fc00_0012".to_string(), json!("cdab"))
        );
        // Known attribute with a type the mapping does not expect.
        assert_eq!(
            ClusterHandler::Basic
                .decode_attribute(BASIC_MODEL, &ZclValue::U8(1))
                .0,
            "0000_0005"
        );
    }

    #[test]
    fn test_set_commands() {
        let (handler, spec) = find_field("state").unwrap();
        assert_eq!(
            handler.encode_set(spec, &json!("TOGGLE")).unwrap(),
            SetRequest::Command {
                command: on_off::TOGGLE,
                payload: vec![]
            }
        );
        let (handler, spec) = find_field("brightness").unwrap();
        assert_eq!(
            handler.encode_set(spec, &json!(200)).unwrap(),
            SetRequest::Command {
                command: MOVE_TO_LEVEL_WITH_ON_OFF,
                payload: vec![200, 0, 0]
            }
        );
        assert!(matches!(
            handler.encode_set(spec, &json!(255)),
            Err(EncodingError::OutOfRange { .. })
        ));
        let (handler, spec) = find_field("color_temp").unwrap();
        assert_eq!(
            handler.encode_set(spec, &json!(370)).unwrap(),
            SetRequest::Command {
                command: MOVE_TO_COLOR_TEMP,
                payload: vec![0x72, 0x01, 0, 0]
            }
        );
    }

    #[test]
    fn test_write_attribute_and_read_only() {
        let (handler, spec) = find_field("location").unwrap();
        assert_eq!(
            handler.encode_set(spec, &json!("kitchen")).unwrap(),
            SetRequest::Write {
                attribute: 0x0010,
                value: ZclValue::String("kitchen".to_string())
            }
        );
        let (handler, spec) = find_field("temperature").unwrap();
        assert!(matches!(
            handler.encode_set(spec, &json!(20)),
            Err(EncodingError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_out_of_range_numeric() {
        let (_, spec) = find_field("temperature").unwrap();
        assert!(matches!(
            from_json(spec, &json!(400.0)),
            Err(EncodingError::OutOfRange { .. })
        ));
        assert!(matches!(
            from_json(spec, &json!("warm")),
            Err(EncodingError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_fractional_input_for_integer_attribute_is_rejected() {
        let (_, voltage) = find_field("voltage").unwrap();
        assert!(matches!(
            from_json(voltage, &json!(3050)),
            Err(EncodingError::InvalidValue { .. })
        ));
        assert_eq!(from_json(voltage, &json!(3000)).unwrap(), ZclValue::U8(30));

        let (_, illuminance) = find_field("illuminance").unwrap();
        assert!(matches!(
            from_json(illuminance, &json!(10.5)),
            Err(EncodingError::InvalidValue { .. })
        ));

        let (_, temperature) = find_field("temperature").unwrap();
        assert!(matches!(
            from_json(temperature, &json!(21.505)),
            Err(EncodingError::InvalidValue { .. })
        ));
        assert_eq!(from_json(temperature, &json!(0.29)).unwrap(), ZclValue::I16(29));
    }

    /// JSON samples for one mapping: both ends of the raw range and a value in between.
    fn samples(spec: &AttributeSpec) -> Vec<Value> {
        match spec.kind {
            ValueKind::Text => vec![json!(""), json!("Living room 2")],
            ValueKind::OnOff => vec![json!("ON"), json!("OFF")],
            ValueKind::Bool | ValueKind::Occupancy => vec![json!(true), json!(false)],
            ValueKind::Numeric => {
                let (min, max) = spec.data_type.range().unwrap();
                [min, min / 2 + max / 2, max]
                    .into_iter()
                    .map(|raw| json!(scale_bound(spec, raw)))
                    .collect()
            }
        }
    }

    #[test]
    fn test_every_mapping_survives_the_wire() {
        let mut checked = 0;
        for handler in ClusterHandler::BUILT_IN {
            assert_eq!(ClusterHandler::for_cluster(handler.cluster_id()), handler);
            for spec in handler.attributes() {
                for sample in samples(spec) {
                    let raw = from_json(spec, &sample)
                        .unwrap_or_else(|e| panic!("{} = {}: {}", spec.field, sample, e));
                    assert_eq!(raw.type_id(), spec.data_type as u8, "{}", spec.field);

                    let payload = encode_report_attributes(&[(spec.attribute, raw.clone())]);
                    let records = decode_report_attributes(&payload).unwrap();
                    assert_eq!(records.len(), 1);
                    assert_eq!(records[0].attribute, spec.attribute);
                    let decoded = records[0].value.clone().unwrap();
                    assert_eq!(decoded, raw, "{}", spec.field);

                    let (field, json) = handler.decode_attribute(spec.attribute, &decoded);
                    assert_eq!(field, spec.field);
                    match spec.kind {
                        ValueKind::Numeric => assert_eq!(
                            json.as_f64(),
                            sample.as_f64(),
                            "{} = {}",
                            spec.field,
                            sample
                        ),
                        _ => assert_eq!(json, sample, "{}", spec.field),
                    }
                    checked += 1;
                }
            }
        }
        assert!(checked >= 30);
    }

    #[test]
    fn test_device_commands() {
        let fields = ClusterHandler::OnOff.decode_command(on_off::TOGGLE, &[]);
        assert_eq!(fields["action"], json!("toggle"));
        let fields = ClusterHandler::Raw(0xfc00).decode_command(0x05, &[0x01]);
        assert_eq!(fields["fc00_cmd_05"], json!("01"));
    }
}
