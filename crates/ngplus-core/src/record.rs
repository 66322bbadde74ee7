//! Parameter records: rows of named numeric fields keyed by row id.
//!
//! ## Serialized layout ([`FixedRowCodec`])
//!
//! ```text
//! row 0: [id: i32 LE][field 0][field 1]...[field n-1]
//! row 1: [id: i32 LE][field 0]...
//! ```
//!
//! Rows are written in ascending id order and every field takes four bytes,
//! so the length depends only on the schema and the row count.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    F32,
    U32,
}

impl FieldType {
    pub const fn size(self) -> usize {
        match self {
            FieldType::F32 => size_of::<f32>(),
            FieldType::U32 => size_of::<u32>(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn f32_field(name: &'static str) -> Field {
    Field { name, ty: FieldType::F32 }
}

/// Rate fields of the per-level effect rows, in declaration order.
pub const SP_EFFECT_FIELDS: [&str; 20] = [
    "maxHpRate",
    "maxStaminaRate",
    "haveSoulRate",
    "physicsAttackPowerRate",
    "magicAttackPowerRate",
    "fireAttackPowerRate",
    "thunderAttackPowerRate",
    "physicsDiffenceRate",
    "magicDiffenceRate",
    "fireDiffenceRate",
    "thunderDiffenceRate",
    "staminaAttackRate",
    "registPoizonChangeRate",
    "registDiseaseChangeRate",
    "registBloodChangeRate",
    "darkDiffenceRate",
    "darkAttackPowerRate",
    "registFreezeChangeRate",
    "registSleepChangeRate",
    "registMadnessChangeRate",
];

pub const BONUS_SOUL_SINGLE: &str = "bonusSoul_single";
pub const BONUS_SOUL_MULTI: &str = "bonusSoul_multi";

/// The record types kept in sync with the level, in application order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum RecordKind {
    /// Per-level enemy stat multipliers
    SpEffectParam,
    /// Boss rune rewards
    GameAreaParam,
}

impl RecordKind {
    pub fn schema(self) -> RecordSchema {
        let fields = match self {
            RecordKind::SpEffectParam => SP_EFFECT_FIELDS.iter().map(|&name| f32_field(name)).collect(),
            RecordKind::GameAreaParam => vec![
                Field { name: BONUS_SOUL_SINGLE, ty: FieldType::U32 },
                Field { name: BONUS_SOUL_MULTI, ty: FieldType::U32 },
            ],
        };
        RecordSchema { kind: self, fields }
    }
}

/// Field layout of one record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub kind: RecordKind,
    pub fields: Vec<Field>,
}

impl RecordSchema {
    /// Serialized size of one row, id included.
    pub fn row_size(&self) -> usize {
        4 + self.fields.iter().map(|f| f.ty.size()).sum::<usize>()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// One row: an id and its field values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: i32,
    pub values: BTreeMap<String, f64>,
}

impl Row {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: f64) -> Self {
        self.values.insert(field.to_string(), value);
        self
    }

    pub fn value(&self, field: &str) -> Result<f64> {
        self.values
            .get(field)
            .copied()
            .ok_or_else(|| Error::Schema(format!("row {} has no field '{}'", self.id, field)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub rows: Vec<Row>,
}

impl Record {
    pub fn new(kind: RecordKind, rows: Vec<Row>) -> Self {
        Self { kind, rows }
    }

    pub fn row(&self, id: i32) -> Option<&Row> {
        self.rows.iter().find(|r| r.id == id)
    }
}

/// Turns records into their in-memory bytes and back.
///
/// Implementations must be length-stable: the same schema and row count
/// always encode to the same number of bytes.
pub trait RecordCodec: Send + Sync {
    fn encode(&self, record: &Record) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8], schema: &RecordSchema) -> Result<Record>;

    /// Encoded length for `rows` rows, if known without encoding.
    fn encoded_len(&self, schema: &RecordSchema, rows: usize) -> usize;
}

/// Fixed-width little-endian row table.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedRowCodec;

impl RecordCodec for FixedRowCodec {
    fn encode(&self, record: &Record) -> Result<Vec<u8>> {
        let schema = record.kind.schema();
        let mut rows: Vec<&Row> = record.rows.iter().collect();
        rows.sort_by_key(|r| r.id);
        if rows.windows(2).any(|w| w[0].id == w[1].id) {
            return Err(Error::Schema(format!("{} has duplicate row ids", record.kind)));
        }

        let mut out = Vec::with_capacity(self.encoded_len(&schema, rows.len()));
        for row in rows {
            out.extend_from_slice(&row.id.to_le_bytes());
            for field in &schema.fields {
                let value = row.value(field.name)?;
                encode_value(&mut out, field, value, row.id)?;
            }
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8], schema: &RecordSchema) -> Result<Record> {
        let row_size = schema.row_size();
        if bytes.len() % row_size != 0 {
            return Err(Error::Schema(format!(
                "{} bytes is not a whole number of {}-byte {} rows",
                bytes.len(),
                row_size,
                schema.kind
            )));
        }

        let rows = bytes
            .chunks_exact(row_size)
            .map(|chunk| {
                let id = i32::from_le_bytes(word(chunk, 0));
                let mut row = Row::new(id);
                let mut at = 4;
                for field in &schema.fields {
                    let raw = word(chunk, at);
                    at += field.ty.size();
                    let value = match field.ty {
                        FieldType::F32 => f32::from_le_bytes(raw) as f64,
                        FieldType::U32 => u32::from_le_bytes(raw) as f64,
                    };
                    row.values.insert(field.name.to_string(), value);
                }
                row
            })
            .collect();

        Ok(Record::new(schema.kind, rows))
    }

    fn encoded_len(&self, schema: &RecordSchema, rows: usize) -> usize {
        schema.row_size() * rows
    }
}

fn word(chunk: &[u8], at: usize) -> [u8; 4] {
    [chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]]
}

fn encode_value(out: &mut Vec<u8>, field: &Field, value: f64, row: i32) -> Result<()> {
    let out_of_range = || {
        Error::Schema(format!(
            "value {} does not fit {:?} field '{}' of row {}",
            value, field.ty, field.name, row
        ))
    };

    match field.ty {
        FieldType::F32 => {
            if !value.is_finite() {
                return Err(out_of_range());
            }
            out.extend_from_slice(&(value as f32).to_le_bytes());
        }
        FieldType::U32 => {
            if !value.is_finite() || value < 0.0 || value > u32::MAX as f64 {
                return Err(out_of_range());
            }
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
    }
    Ok(())
}
