//! Level-driven scaling of record values.
//!
//! Levels 0 and 1 leave values unchanged. Levels `2..=K` use a per-field
//! tier table. Past `K` the last tier grows by a fixed increment per level,
//! additively.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::record::{
    BONUS_SOUL_MULTI, BONUS_SOUL_SINGLE, Record, RecordKind, Row, SP_EFFECT_FIELDS,
};

const BUILTIN_PROFILE: &str = include_str!("../data/scaling_profile.json");

/// The field whose curve also drives boss rewards.
pub const REWARD_FIELD: &str = "haveSoulRate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldScaling {
    /// Multipliers for levels 2..=K, index `level - 2`.
    pub tiers: Vec<f64>,
    /// Added to the last tier for every level past K.
    pub per_level_increment: f64,
}

/// Immutable scaling constants: field curves, row base values, boss rewards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingTable {
    pub name: String,
    /// K: the highest level covered by the tier tables.
    pub tiered_max_level: u32,
    pub fields: BTreeMap<String, FieldScaling>,
    /// Base value of every tracked field, per effect row.
    pub rows: BTreeMap<i32, BTreeMap<String, f64>>,
    /// Default rune reward per boss row.
    pub boss_rewards: BTreeMap<i32, u32>,
}

impl ScalingTable {
    /// The profile compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_PROFILE)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let table: ScalingTable = serde_json::from_str(content)?;
        table.validate()?;
        Ok(table)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let table = Self::from_json(&content)?;
        debug!(
            "Loaded scaling profile '{}' from {} ({} rows, {} bosses)",
            table.name,
            path.as_ref().display(),
            table.rows.len(),
            table.boss_rewards.len()
        );
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiered_max_level < 2 {
            return Err(Error::Config(format!(
                "tiered_max_level must be at least 2, got {}",
                self.tiered_max_level
            )));
        }

        let expected = (self.tiered_max_level - 1) as usize;
        for (name, field) in &self.fields {
            if field.tiers.len() != expected {
                return Err(Error::Config(format!(
                    "field '{}' has {} tiers, expected {}",
                    name,
                    field.tiers.len(),
                    expected
                )));
            }
        }

        for (id, values) in &self.rows {
            if let Some(unknown) = values.keys().find(|f| !self.fields.contains_key(*f)) {
                return Err(Error::Config(format!(
                    "row {} uses field '{}' that has no scaling curve",
                    id, unknown
                )));
            }
        }
        Ok(())
    }
}

/// Computes multipliers and whole records for a level.
#[derive(Debug, Clone)]
pub struct ScalingEngine {
    table: ScalingTable,
}

impl ScalingEngine {
    pub fn new(table: ScalingTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ScalingTable {
        &self.table
    }

    /// Scaled value of `base` for `field` at `level`.
    pub fn multiplier(&self, base: f64, field: &str, level: u32) -> Result<f64> {
        let scaling = self
            .table
            .fields
            .get(field)
            .ok_or_else(|| Error::Config(format!("no scaling curve for field '{}'", field)))?;
        let k = self.table.tiered_max_level;

        let tier = |index: u32| {
            scaling.tiers.get(index as usize).copied().ok_or_else(|| {
                Error::Config(format!("field '{}' has no tier for level {}", field, index + 2))
            })
        };

        let factor = match level {
            0 | 1 => return Ok(base),
            l if l <= k => tier(l - 2)?,
            l => tier(k - 2)? + (l - k) as f64 * scaling.per_level_increment,
        };
        Ok(base * factor)
    }

    /// Record contents for `kind` at `level`.
    pub fn record(&self, kind: RecordKind, level: u32) -> Result<Record> {
        match kind {
            RecordKind::SpEffectParam => self.effect_record(level),
            RecordKind::GameAreaParam => self.reward_record(level),
        }
    }

    fn effect_record(&self, level: u32) -> Result<Record> {
        let mut rows = Vec::with_capacity(self.table.rows.len());
        for (&id, bases) in &self.table.rows {
            let mut row = Row::new(id);
            for field in SP_EFFECT_FIELDS {
                let base = bases.get(field).copied().ok_or_else(|| {
                    Error::Config(format!("row {} has no base value for '{}'", id, field))
                })?;
                row.values.insert(field.to_string(), self.multiplier(base, field, level)?);
            }
            rows.push(row);
        }
        Ok(Record::new(RecordKind::SpEffectParam, rows))
    }

    /// Boss rewards are scaled by the reward curve alone. The host applies
    /// its own NG+1 reward bonus on top, so the totals are approximate.
    /// Rewards saturate at the largest value the field can hold.
    fn reward_record(&self, level: u32) -> Result<Record> {
        let factor = self.multiplier(1.0, REWARD_FIELD, level)?;
        let rows = self
            .table
            .boss_rewards
            .iter()
            .map(|(&id, &reward)| {
                let scaled = (reward as f64 * factor).floor().min(u32::MAX as f64);
                Row::new(id)
                    .with(BONUS_SOUL_SINGLE, scaled)
                    .with(BONUS_SOUL_MULTI, scaled)
            })
            .collect();
        Ok(Record::new(RecordKind::GameAreaParam, rows))
    }

    /// Per-level growth past the tier table, by field.
    pub fn increments(&self) -> impl Iterator<Item = (&str, f64)> {
        self.table
            .fields
            .iter()
            .map(|(name, scaling)| (name.as_str(), scaling.per_level_increment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FixedRowCodec, RecordCodec};

    fn engine() -> ScalingEngine {
        ScalingEngine::new(ScalingTable::builtin().unwrap())
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_builtin_profile_loads() {
        let table = ScalingTable::builtin().unwrap();
        assert_eq!(table.tiered_max_level, 7);
        assert_eq!(table.fields.len(), 20);
        assert_eq!(table.rows.len(), 35);
        assert!(table.rows.contains_key(&7400));
        assert!(table.rows.contains_key(&20007530));
        assert_eq!(table.boss_rewards.get(&10000800), Some(&20000));
    }

    #[test]
    fn test_baseline_levels_are_identity() {
        let engine = engine();
        for field in SP_EFFECT_FIELDS {
            assert_eq!(engine.multiplier(3.25, field, 0).unwrap(), 3.25);
            assert_eq!(engine.multiplier(3.25, field, 1).unwrap(), 3.25);
        }
    }

    #[test]
    fn test_tier_levels_are_exact() {
        let engine = engine();
        let tiers = engine.table().fields["maxHpRate"].tiers.clone();
        for level in 2..=7u32 {
            assert_eq!(
                engine.multiplier(2.0, "maxHpRate", level).unwrap(),
                2.0 * tiers[(level - 2) as usize]
            );
        }
    }

    #[test]
    fn test_growth_past_tiers_is_linear() {
        let engine = engine();
        let inc = engine.table().fields["haveSoulRate"].per_level_increment;
        for level in 7..40u32 {
            let step = engine.multiplier(5.0, "haveSoulRate", level + 1).unwrap()
                - engine.multiplier(5.0, "haveSoulRate", level).unwrap();
            assert_close(step, 5.0 * inc);
        }
        // level 20: last tier plus 13 increments
        assert_close(
            engine.multiplier(1.0, "maxHpRate", 20).unwrap(),
            1.4 + 13.0 * 0.05,
        );
    }

    #[test]
    fn test_unknown_field_is_config_error() {
        let err = engine().multiplier(1.0, "poiseRate", 3).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_effect_record_at_level() {
        let engine = engine();
        let record = engine.record(RecordKind::SpEffectParam, 5).unwrap();
        assert_eq!(record.rows.len(), 35);

        let row = record.row(7400).unwrap();
        let base = engine.table().rows[&7400]["maxHpRate"];
        assert_eq!(row.value("maxHpRate").unwrap(), base * 1.3);
    }

    #[test]
    fn test_reward_record_floors() {
        let engine = engine();
        let record = engine.record(RecordKind::GameAreaParam, 2).unwrap();
        let row = record.row(10000850).unwrap();
        // 12000 * 1.1, floored
        assert_eq!(row.value(BONUS_SOUL_SINGLE).unwrap(), (12000.0f64 * 1.1).floor());
        assert_eq!(row.value(BONUS_SOUL_MULTI).unwrap(), row.value(BONUS_SOUL_SINGLE).unwrap());

        let vanilla = engine.record(RecordKind::GameAreaParam, 1).unwrap();
        assert_eq!(vanilla.row(10000850).unwrap().value(BONUS_SOUL_SINGLE).unwrap(), 12000.0);
    }

    #[test]
    fn test_huge_level_saturates_rewards() {
        let engine = engine();
        let record = engine.record(RecordKind::GameAreaParam, 400_000).unwrap();
        let row = record.row(19000800).unwrap();
        assert_eq!(row.value(BONUS_SOUL_SINGLE).unwrap(), u32::MAX as f64);
        let row = record.row(10000800).unwrap();
        assert!(row.value(BONUS_SOUL_SINGLE).unwrap() < u32::MAX as f64);
        assert!(FixedRowCodec.encode(&record).is_ok());
    }

    #[test]
    fn test_validate_rejects_short_tiers() {
        let json = r#"{
            "name": "broken",
            "tiered_max_level": 4,
            "fields": { "maxHpRate": { "tiers": [1.1, 1.2], "per_level_increment": 0.1 } },
            "rows": {},
            "boss_rewards": {}
        }"#;
        assert!(matches!(ScalingTable::from_json(json), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        let json = r#"{
            "name": "tiny",
            "tiered_max_level": 3,
            "fields": { "haveSoulRate": { "tiers": [2.0, 3.0], "per_level_increment": 1.0 } },
            "rows": {},
            "boss_rewards": { "1": 100 }
        }"#;
        std::fs::write(&path, json).unwrap();

        let engine = ScalingEngine::new(ScalingTable::load(&path).unwrap());
        assert_eq!(engine.multiplier(1.0, "haveSoulRate", 3).unwrap(), 3.0);
        assert_eq!(engine.multiplier(1.0, "haveSoulRate", 5).unwrap(), 5.0);
        let rewards = engine.record(RecordKind::GameAreaParam, 5).unwrap();
        assert_eq!(rewards.rows[0].value(BONUS_SOUL_SINGLE).unwrap(), 500.0);
    }
}
