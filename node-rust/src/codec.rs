//! Push-frame decoding.
//!
//! Vehicles send one of two binary encodings per message:
//!
//! - protobuf `TelemetryPayload` (the common case), or
//! - a FlatBuffer rendition, identified by the 4-byte file identifier
//!   `TLFB` at offset 4. The FlatBuffer schema mirrors the protobuf shape:
//!   root table `(vin: string, created_at_ms: int64, data: [Datum])`,
//!   `Datum(key: string, vtype: uint8, dbl: float64, int: int64,
//!   flag: bool, text: string, lat: float64, lon: float64,
//!   heading: float64, speed: float64)`.
//!
//! Both paths funnel through the mapper; unknown field names and
//! un-coercible values are dropped, not errors.

use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use vehicle_types::wire::{telemetry_value, LocationValue, TelemetryPayload, TelemetryValue};
use vehicle_types::TelemetryFrame;

use crate::errors::{NodeError, Result};
use crate::mapper::TelemetryMapper;

/// FlatBuffer file identifier, bytes 4..8 of the buffer.
pub const FLATBUF_IDENT: &[u8; 4] = b"TLFB";

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Decode one binary message into a telemetry frame. `fallback_vin` is the
/// authenticated VIN from the hello; frames that omit their own VIN inherit
/// it.
pub fn decode_frame(
    bytes: &[u8],
    mapper: &TelemetryMapper,
    fallback_vin: &str,
) -> Result<TelemetryFrame> {
    let (vin, captured_at, data) = if is_flatbuf(bytes) {
        decode_flatbuf(bytes)?
    } else {
        decode_protobuf(bytes)?
    };

    let mut fields = std::collections::HashMap::new();
    for (key, value) in &data {
        if let Some((field, fv)) = mapper.normalize(key, value) {
            fields.insert(field, fv);
        }
    }
    if fields.is_empty() {
        return Err(NodeError::Decode("frame carried no usable fields".into()));
    }

    Ok(TelemetryFrame {
        vin: if vin.is_empty() { fallback_vin.to_string() } else { vin },
        captured_at: captured_at.unwrap_or_else(now_ms),
        fields,
    })
}

pub fn is_flatbuf(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && &bytes[4..8] == FLATBUF_IDENT
}

fn decode_protobuf(bytes: &[u8]) -> Result<(String, Option<i64>, Vec<(String, TelemetryValue)>)> {
    let payload = TelemetryPayload::decode(bytes)?;
    let captured_at = payload
        .created_at
        .map(|ts| ts.seconds * 1000 + i64::from(ts.nanos) / 1_000_000);
    let data = payload
        .data
        .into_iter()
        .filter_map(|d| d.value.map(|v| (d.key, v)))
        .collect();
    Ok((payload.vin, captured_at, data))
}

// ── FlatBuffer walker ─────────────────────────────────────────────────────────
//
// A minimal bounds-checked reader over the FlatBuffer binary layout:
// u32le root offset, vtables located through the table's leading i32, field
// slots as u16 offsets from the table position, strings and vectors behind
// u32 indirections.

struct FbReader<'a> {
    buf: &'a [u8],
}

#[derive(Clone, Copy)]
struct FbTable {
    pos: usize,
}

impl<'a> FbReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn bytes(&self, pos: usize, len: usize) -> Result<&'a [u8]> {
        self.buf
            .get(pos..pos + len)
            .ok_or_else(|| NodeError::Decode(format!("flatbuf truncated at {pos}+{len}")))
    }

    fn u16_at(&self, pos: usize) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(pos, 2)?.try_into().unwrap()))
    }

    fn u32_at(&self, pos: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(pos, 4)?.try_into().unwrap()))
    }

    fn i32_at(&self, pos: usize) -> Result<i32> {
        Ok(i32::from_le_bytes(self.bytes(pos, 4)?.try_into().unwrap()))
    }

    fn i64_at(&self, pos: usize) -> Result<i64> {
        Ok(i64::from_le_bytes(self.bytes(pos, 8)?.try_into().unwrap()))
    }

    fn f64_at(&self, pos: usize) -> Result<f64> {
        Ok(f64::from_le_bytes(self.bytes(pos, 8)?.try_into().unwrap()))
    }

    fn root(&self) -> Result<FbTable> {
        let off = self.u32_at(0)? as usize;
        if off >= self.buf.len() {
            return Err(NodeError::Decode("flatbuf root offset out of range".into()));
        }
        Ok(FbTable { pos: off })
    }

    /// Absolute position of a field's value, or `None` when the writer
    /// omitted it.
    fn field_pos(&self, table: FbTable, index: usize) -> Result<Option<usize>> {
        let soffset = self.i32_at(table.pos)? as i64;
        let vtable = table.pos as i64 - soffset;
        if vtable < 0 {
            return Err(NodeError::Decode("flatbuf vtable before buffer start".into()));
        }
        let vtable = vtable as usize;
        let vt_len = self.u16_at(vtable)? as usize;
        let slot = 4 + 2 * index;
        if slot + 2 > vt_len {
            return Ok(None);
        }
        let off = self.u16_at(vtable + slot)? as usize;
        if off == 0 {
            return Ok(None);
        }
        Ok(Some(table.pos + off))
    }

    fn indirect(&self, pos: usize) -> Result<usize> {
        let off = self.u32_at(pos)? as usize;
        let target = pos + off;
        if target >= self.buf.len() {
            return Err(NodeError::Decode("flatbuf indirection out of range".into()));
        }
        Ok(target)
    }

    fn string_field(&self, table: FbTable, index: usize) -> Result<Option<String>> {
        let Some(pos) = self.field_pos(table, index)? else {
            return Ok(None);
        };
        let target = self.indirect(pos)?;
        let len = self.u32_at(target)? as usize;
        let raw = self.bytes(target + 4, len)?;
        let s = std::str::from_utf8(raw)
            .map_err(|_| NodeError::Decode("flatbuf string not UTF-8".into()))?;
        Ok(Some(s.to_string()))
    }

    fn f64_field(&self, table: FbTable, index: usize) -> Result<Option<f64>> {
        match self.field_pos(table, index)? {
            Some(pos) => Ok(Some(self.f64_at(pos)?)),
            None => Ok(None),
        }
    }

    fn i64_field(&self, table: FbTable, index: usize) -> Result<Option<i64>> {
        match self.field_pos(table, index)? {
            Some(pos) => Ok(Some(self.i64_at(pos)?)),
            None => Ok(None),
        }
    }

    fn u8_field(&self, table: FbTable, index: usize) -> Result<Option<u8>> {
        match self.field_pos(table, index)? {
            Some(pos) => Ok(Some(self.bytes(pos, 1)?[0])),
            None => Ok(None),
        }
    }

    /// Vector of table offsets: returns the element positions.
    fn table_vector_field(&self, table: FbTable, index: usize) -> Result<Vec<FbTable>> {
        let Some(pos) = self.field_pos(table, index)? else {
            return Ok(Vec::new());
        };
        let target = self.indirect(pos)?;
        let count = self.u32_at(target)? as usize;
        if count > 4096 {
            return Err(NodeError::Decode("flatbuf vector implausibly large".into()));
        }
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let elem_pos = target + 4 + 4 * i;
            out.push(FbTable { pos: self.indirect(elem_pos)? });
        }
        Ok(out)
    }
}

// Root table slots.
const ROOT_VIN: usize = 0;
const ROOT_CREATED_AT_MS: usize = 1;
const ROOT_DATA: usize = 2;

// Datum table slots.
const DATUM_KEY: usize = 0;
const DATUM_VTYPE: usize = 1;
const DATUM_DBL: usize = 2;
const DATUM_INT: usize = 3;
const DATUM_FLAG: usize = 4;
const DATUM_TEXT: usize = 5;
const DATUM_LAT: usize = 6;
const DATUM_LON: usize = 7;
const DATUM_HEADING: usize = 8;
const DATUM_SPEED: usize = 9;

const VTYPE_DOUBLE: u8 = 0;
const VTYPE_INT: u8 = 1;
const VTYPE_BOOL: u8 = 2;
const VTYPE_TEXT: u8 = 3;
const VTYPE_LOCATION: u8 = 4;

fn decode_flatbuf(bytes: &[u8]) -> Result<(String, Option<i64>, Vec<(String, TelemetryValue)>)> {
    let r = FbReader::new(bytes);
    let root = r.root()?;

    let vin = r.string_field(root, ROOT_VIN)?.unwrap_or_default();
    let captured_at = r.i64_field(root, ROOT_CREATED_AT_MS)?;

    let mut data = Vec::new();
    for datum in r.table_vector_field(root, ROOT_DATA)? {
        let Some(key) = r.string_field(datum, DATUM_KEY)? else {
            continue;
        };
        let vtype = r.u8_field(datum, DATUM_VTYPE)?.unwrap_or(VTYPE_DOUBLE);
        let value = match vtype {
            VTYPE_DOUBLE => r
                .f64_field(datum, DATUM_DBL)?
                .map(telemetry_value::Value::Double),
            VTYPE_INT => r.i64_field(datum, DATUM_INT)?.map(telemetry_value::Value::Int),
            VTYPE_BOOL => r
                .u8_field(datum, DATUM_FLAG)?
                .map(|b| telemetry_value::Value::Flag(b != 0)),
            VTYPE_TEXT => r
                .string_field(datum, DATUM_TEXT)?
                .map(telemetry_value::Value::Text),
            VTYPE_LOCATION => {
                let lat = r.f64_field(datum, DATUM_LAT)?;
                let lon = r.f64_field(datum, DATUM_LON)?;
                match (lat, lon) {
                    (Some(lat), Some(lon)) => {
                        Some(telemetry_value::Value::Loc(LocationValue {
                            lat,
                            lon,
                            heading: r.f64_field(datum, DATUM_HEADING)?,
                            speed: r.f64_field(datum, DATUM_SPEED)?,
                        }))
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(value) = value {
            data.push((key, TelemetryValue { value: Some(value) }));
        }
    }

    Ok((vin, captured_at, data))
}
