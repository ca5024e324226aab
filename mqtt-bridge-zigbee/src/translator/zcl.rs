//! ZCL frame and attribute value codecs.
//!
//! Frame layout: frame control u8, manufacturer code u16 when bit 2 is set,
//! transaction sequence u8, command id u8, payload. All values little-endian.

use crate::wire::ByteReader;

use super::DecodingError;

/// Frame control bits.
pub mod frame_control {
    /// Command is specific to the cluster rather than a global command.
    pub const CLUSTER_SPECIFIC: u8 = 0x01;
    pub const MANUFACTURER_SPECIFIC: u8 = 0x04;
    pub const SERVER_TO_CLIENT: u8 = 0x08;
    pub const DISABLE_DEFAULT_RESPONSE: u8 = 0x10;
}

/// Global command ids.
pub mod command {
    pub const READ_ATTRIBUTES: u8 = 0x00;
    pub const READ_ATTRIBUTES_RESPONSE: u8 = 0x01;
    pub const WRITE_ATTRIBUTES: u8 = 0x02;
    pub const WRITE_ATTRIBUTES_RESPONSE: u8 = 0x04;
    pub const REPORT_ATTRIBUTES: u8 = 0x0A;
    pub const DEFAULT_RESPONSE: u8 = 0x0B;
}

/// ZCL status codes the bridge cares about.
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const UNSUPPORTED_ATTRIBUTE: u8 = 0x86;
}

/// ZCL frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZclHeader {
    pub frame_control: u8,
    pub manufacturer: Option<u16>,
    pub seq: u8,
    pub command: u8,
}

impl ZclHeader {
    /// Header of a global command sent by the bridge.
    pub fn global(seq: u8, command: u8) -> Self {
        Self {
            frame_control: 0,
            manufacturer: None,
            seq,
            command,
        }
    }

    /// Header of a cluster-specific command sent by the bridge.
    pub fn cluster_specific(seq: u8, command: u8) -> Self {
        Self {
            frame_control: frame_control::CLUSTER_SPECIFIC,
            manufacturer: None,
            seq,
            command,
        }
    }

    pub fn is_cluster_specific(&self) -> bool {
        self.frame_control & frame_control::CLUSTER_SPECIFIC != 0
    }
}

/// A complete ZCL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZclFrame {
    pub header: ZclHeader,
    pub payload: Vec<u8>,
}

impl ZclFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.payload.len());
        let mut fc = self.header.frame_control;
        if self.header.manufacturer.is_some() {
            fc |= frame_control::MANUFACTURER_SPECIFIC;
        } else {
            fc &= !frame_control::MANUFACTURER_SPECIFIC;
        }
        out.push(fc);
        if let Some(code) = self.header.manufacturer {
            out.extend_from_slice(&code.to_le_bytes());
        }
        out.push(self.header.seq);
        out.push(self.header.command);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodingError> {
        let mut r = ByteReader::new(bytes);
        let frame_control = r.u8().ok_or(DecodingError::Truncated("frame control"))?;
        let manufacturer = if frame_control & frame_control::MANUFACTURER_SPECIFIC != 0 {
            Some(r.u16().ok_or(DecodingError::Truncated("manufacturer code"))?)
        } else {
            None
        };
        let seq = r.u8().ok_or(DecodingError::Truncated("sequence number"))?;
        let command = r.u8().ok_or(DecodingError::Truncated("command id"))?;
        Ok(Self {
            header: ZclHeader {
                frame_control,
                manufacturer,
                seq,
                command,
            },
            payload: r.rest().to_vec(),
        })
    }
}

/// Supported ZCL data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Bool = 0x10,
    Bitmap8 = 0x18,
    Bitmap16 = 0x19,
    Uint8 = 0x20,
    Uint16 = 0x21,
    Uint32 = 0x23,
    Int8 = 0x28,
    Int16 = 0x29,
    Int32 = 0x2B,
    Enum8 = 0x30,
    Float32 = 0x39,
    String = 0x42,
}

impl DataType {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0x10 => Self::Bool,
            0x18 => Self::Bitmap8,
            0x19 => Self::Bitmap16,
            0x20 => Self::Uint8,
            0x21 => Self::Uint16,
            0x23 => Self::Uint32,
            0x28 => Self::Int8,
            0x29 => Self::Int16,
            0x2B => Self::Int32,
            0x30 => Self::Enum8,
            0x39 => Self::Float32,
            0x42 => Self::String,
            _ => return None,
        })
    }

    /// Inclusive numeric range, for integer types.
    pub fn range(self) -> Option<(i64, i64)> {
        Some(match self {
            Self::Bool => (0, 1),
            Self::Bitmap8 | Self::Uint8 | Self::Enum8 => (0, u8::MAX as i64),
            Self::Bitmap16 | Self::Uint16 => (0, u16::MAX as i64),
            Self::Uint32 => (0, u32::MAX as i64),
            Self::Int8 => (i8::MIN as i64, i8::MAX as i64),
            Self::Int16 => (i16::MIN as i64, i16::MAX as i64),
            Self::Int32 => (i32::MIN as i64, i32::MAX as i64),
            Self::Float32 | Self::String => return None,
        })
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum ZclValue {
    Bool(bool),
    Bitmap8(u8),
    Bitmap16(u16),
    U8(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    I16(i16),
    I32(i32),
    Enum8(u8),
    F32(f32),
    String(String),
    /// A data type the bridge does not interpret.
    Raw { data_type: u8, bytes: Vec<u8> },
}

impl ZclValue {
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Bool(_) => DataType::Bool as u8,
            Self::Bitmap8(_) => DataType::Bitmap8 as u8,
            Self::Bitmap16(_) => DataType::Bitmap16 as u8,
            Self::U8(_) => DataType::Uint8 as u8,
            Self::U16(_) => DataType::Uint16 as u8,
            Self::U32(_) => DataType::Uint32 as u8,
            Self::I8(_) => DataType::Int8 as u8,
            Self::I16(_) => DataType::Int16 as u8,
            Self::I32(_) => DataType::Int32 as u8,
            Self::Enum8(_) => DataType::Enum8 as u8,
            Self::F32(_) => DataType::Float32 as u8,
            Self::String(_) => DataType::String as u8,
            Self::Raw { data_type, .. } => *data_type,
        }
    }

    /// Numeric view, for scaling.
    pub fn as_f64(&self) -> Option<f64> {
        Some(match self {
            Self::Bool(v) => *v as u8 as f64,
            Self::Bitmap8(v) | Self::U8(v) | Self::Enum8(v) => *v as f64,
            Self::Bitmap16(v) | Self::U16(v) => *v as f64,
            Self::U32(v) => *v as f64,
            Self::I8(v) => *v as f64,
            Self::I16(v) => *v as f64,
            Self::I32(v) => *v as f64,
            Self::F32(v) => *v as f64,
            Self::String(_) | Self::Raw { .. } => return None,
        })
    }

    /// Build a value of `data_type` from an integer already range-checked by the caller.
    pub fn from_integer(data_type: DataType, v: i64) -> Option<Self> {
        Some(match data_type {
            DataType::Bool => Self::Bool(v != 0),
            DataType::Bitmap8 => Self::Bitmap8(u8::try_from(v).ok()?),
            DataType::Bitmap16 => Self::Bitmap16(u16::try_from(v).ok()?),
            DataType::Uint8 => Self::U8(u8::try_from(v).ok()?),
            DataType::Uint16 => Self::U16(u16::try_from(v).ok()?),
            DataType::Uint32 => Self::U32(u32::try_from(v).ok()?),
            DataType::Int8 => Self::I8(i8::try_from(v).ok()?),
            DataType::Int16 => Self::I16(i16::try_from(v).ok()?),
            DataType::Int32 => Self::I32(i32::try_from(v).ok()?),
            DataType::Enum8 => Self::Enum8(u8::try_from(v).ok()?),
            DataType::Float32 => Self::F32(v as f32),
            DataType::String => return None,
        })
    }

    /// Lowercase hex of the encoded value bytes.
    pub fn to_hex(&self) -> String {
        let mut out = Vec::new();
        self.write_value(&mut out);
        out.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Append the value bytes (without type id).
    pub fn write_value(&self, out: &mut Vec<u8>) {
        match self {
            Self::Bool(v) => out.push(*v as u8),
            Self::Bitmap8(v) | Self::U8(v) | Self::Enum8(v) => out.push(*v),
            Self::Bitmap16(v) | Self::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::String(s) => {
                let bytes = s.as_bytes();
                let len = bytes.len().min(u8::MAX as usize - 1);
                out.push(len as u8);
                out.extend_from_slice(&bytes[..len]);
            }
            Self::Raw { bytes, .. } => out.extend_from_slice(bytes),
        }
    }

    /// Read a value of `type_id`.
    ///
    /// Unknown types consume the remaining input as [`ZclValue::Raw`].
    pub(crate) fn read(type_id: u8, r: &mut ByteReader<'_>) -> Result<Self, DecodingError> {
        const VALUE: &str = "attribute value";
        let Some(data_type) = DataType::from_u8(type_id) else {
            return Ok(Self::Raw {
                data_type: type_id,
                bytes: r.rest().to_vec(),
            });
        };
        let value = match data_type {
            DataType::Bool => Self::Bool(r.u8().ok_or(DecodingError::Truncated(VALUE))? != 0),
            DataType::Bitmap8 => Self::Bitmap8(r.u8().ok_or(DecodingError::Truncated(VALUE))?),
            DataType::Bitmap16 => Self::Bitmap16(r.u16().ok_or(DecodingError::Truncated(VALUE))?),
            DataType::Uint8 => Self::U8(r.u8().ok_or(DecodingError::Truncated(VALUE))?),
            DataType::Uint16 => Self::U16(r.u16().ok_or(DecodingError::Truncated(VALUE))?),
            DataType::Uint32 => Self::U32(r.u32().ok_or(DecodingError::Truncated(VALUE))?),
            DataType::Int8 => Self::I8(i8::from_le_bytes(
                r.array().ok_or(DecodingError::Truncated(VALUE))?,
            )),
            DataType::Int16 => Self::I16(i16::from_le_bytes(
                r.array().ok_or(DecodingError::Truncated(VALUE))?,
            )),
            DataType::Int32 => Self::I32(i32::from_le_bytes(
                r.array().ok_or(DecodingError::Truncated(VALUE))?,
            )),
            DataType::Enum8 => Self::Enum8(r.u8().ok_or(DecodingError::Truncated(VALUE))?),
            DataType::Float32 => Self::F32(f32::from_le_bytes(
                r.array().ok_or(DecodingError::Truncated(VALUE))?,
            )),
            DataType::String => {
                let len = r.u8().ok_or(DecodingError::Truncated("string length"))?;
                // 0xFF marks an invalid (absent) string.
                let len = if len == 0xFF { 0 } else { len as usize };
                let bytes = r.bytes(len).ok_or(DecodingError::Truncated("string"))?;
                Self::String(String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string())
            }
        };
        Ok(value)
    }
}

/// One attribute record from a report or read response.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRecord {
    pub attribute: u16,
    pub status: u8,
    /// `None` when the status is not success.
    pub value: Option<ZclValue>,
}

/// One status record from a write response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStatus {
    pub status: u8,
    pub attribute: Option<u16>,
}

pub fn encode_read_attributes(attributes: &[u16]) -> Vec<u8> {
    attributes.iter().flat_map(|a| a.to_le_bytes()).collect()
}

pub fn encode_write_attributes(records: &[(u16, ZclValue)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (attribute, value) in records {
        out.extend_from_slice(&attribute.to_le_bytes());
        out.push(value.type_id());
        value.write_value(&mut out);
    }
    out
}

pub fn encode_report_attributes(records: &[(u16, ZclValue)]) -> Vec<u8> {
    encode_write_attributes(records)
}

pub fn decode_read_attributes(payload: &[u8]) -> Result<Vec<u16>, DecodingError> {
    if payload.len() % 2 != 0 {
        return Err(DecodingError::Truncated("attribute id"));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

pub fn decode_report_attributes(payload: &[u8]) -> Result<Vec<AttributeRecord>, DecodingError> {
    let mut r = ByteReader::new(payload);
    let mut records = Vec::new();
    while !r.is_empty() {
        let attribute = r.u16().ok_or(DecodingError::Truncated("attribute id"))?;
        let type_id = r.u8().ok_or(DecodingError::Truncated("data type"))?;
        let value = ZclValue::read(type_id, &mut r)?;
        records.push(AttributeRecord {
            attribute,
            status: status::SUCCESS,
            value: Some(value),
        });
    }
    Ok(records)
}

pub fn encode_read_attributes_response(records: &[AttributeRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(&record.attribute.to_le_bytes());
        out.push(record.status);
        if let (status::SUCCESS, Some(value)) = (record.status, &record.value) {
            out.push(value.type_id());
            value.write_value(&mut out);
        }
    }
    out
}

pub fn decode_read_attributes_response(
    payload: &[u8],
) -> Result<Vec<AttributeRecord>, DecodingError> {
    let mut r = ByteReader::new(payload);
    let mut records = Vec::new();
    while !r.is_empty() {
        let attribute = r.u16().ok_or(DecodingError::Truncated("attribute id"))?;
        let status = r.u8().ok_or(DecodingError::Truncated("status"))?;
        let value = if status == status::SUCCESS {
            let type_id = r.u8().ok_or(DecodingError::Truncated("data type"))?;
            Some(ZclValue::read(type_id, &mut r)?)
        } else {
            None
        };
        records.push(AttributeRecord {
            attribute,
            status,
            value,
        });
    }
    Ok(records)
}

/// A write response is either a single success byte or a list of failures.
pub fn decode_write_attributes_response(payload: &[u8]) -> Result<Vec<WriteStatus>, DecodingError> {
    if payload == [status::SUCCESS] {
        return Ok(vec![WriteStatus {
            status: status::SUCCESS,
            attribute: None,
        }]);
    }
    let mut r = ByteReader::new(payload);
    let mut statuses = Vec::new();
    while !r.is_empty() {
        let status = r.u8().ok_or(DecodingError::Truncated("status"))?;
        let attribute = r.u16().ok_or(DecodingError::Truncated("attribute id"))?;
        statuses.push(WriteStatus {
            status,
            attribute: Some(attribute),
        });
    }
    if statuses.is_empty() {
        return Err(DecodingError::Truncated("write status"));
    }
    Ok(statuses)
}

/// Default response: (command id it answers, status).
pub fn decode_default_response(payload: &[u8]) -> Result<(u8, u8), DecodingError> {
    match payload {
        [command, status, ..] => Ok((*command, *status)),
        _ => Err(DecodingError::Truncated("default response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = ZclFrame {
            header: ZclHeader::global(0x42, command::READ_ATTRIBUTES),
            payload: encode_read_attributes(&[0x0004, 0x0005]),
        };
        assert_eq!(frame.encode(), vec![0x00, 0x42, 0x00, 0x04, 0x00, 0x05, 0x00]);
        assert_eq!(ZclFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_manufacturer_specific_header() {
        let bytes = [0x1c, 0x5f, 0x11, 0x07, 0x0a, 0xaa];
        let frame = ZclFrame::decode(&bytes).unwrap();
        assert_eq!(frame.header.manufacturer, Some(0x115f));
        assert_eq!(frame.header.seq, 7);
        assert_eq!(frame.header.command, command::REPORT_ATTRIBUTES);
        assert_eq!(frame.payload, vec![0xaa]);
        assert_eq!(frame.encode(), bytes.to_vec());
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            ZclFrame::decode(&[0x04, 0x5f]),
            Err(DecodingError::Truncated(_))
        ));
        assert!(matches!(ZclFrame::decode(&[]), Err(DecodingError::Truncated(_))));
    }

    #[test]
    fn test_report_values() {
        // temperature int16 2150, then a string
        let payload = [
            0x00, 0x00, 0x29, 0x66, 0x08, 0x05, 0x00, 0x42, 0x03, b'a', b'b', b'c',
        ];
        let records = decode_report_attributes(&payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value, Some(ZclValue::I16(2150)));
        assert_eq!(records[1].value, Some(ZclValue::String("abc".to_string())));
    }

    #[test]
    fn test_unknown_type_consumes_rest() {
        let payload = [0x34, 0x12, 0xe0, 0x01, 0x02, 0x03];
        let records = decode_report_attributes(&payload).unwrap();
        assert_eq!(
            records[0].value,
            Some(ZclValue::Raw {
                data_type: 0xe0,
                bytes: vec![1, 2, 3]
            })
        );
    }

    #[test]
    fn test_read_response_with_failure() {
        let records = vec![
            AttributeRecord {
                attribute: 0x0004,
                status: status::SUCCESS,
                value: Some(ZclValue::String("IKEA".to_string())),
            },
            AttributeRecord {
                attribute: 0x0005,
                status: status::UNSUPPORTED_ATTRIBUTE,
                value: None,
            },
        ];
        let payload = encode_read_attributes_response(&records);
        assert_eq!(decode_read_attributes_response(&payload).unwrap(), records);
    }

    #[test]
    fn test_write_response_forms() {
        assert_eq!(
            decode_write_attributes_response(&[0x00]).unwrap(),
            vec![WriteStatus {
                status: 0,
                attribute: None
            }]
        );
        let failed = decode_write_attributes_response(&[0x86, 0x10, 0x00]).unwrap();
        assert_eq!(failed[0].attribute, Some(0x0010));
        assert!(decode_write_attributes_response(&[]).is_err());
    }

    #[test]
    fn test_data_type_ranges() {
        assert_eq!(DataType::Int16.range(), Some((-32768, 32767)));
        assert_eq!(ZclValue::from_integer(DataType::Uint8, 256), None);
        assert_eq!(ZclValue::from_integer(DataType::Int8, -5), Some(ZclValue::I8(-5)));
        assert_eq!(ZclValue::I16(2150).to_hex(), "6608");
    }
}
