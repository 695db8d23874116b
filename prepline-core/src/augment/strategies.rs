//! Row generation strategies.

use super::sampling::{beta, normal};
use crate::data::table::{Cell, ColumnData, DataType, Table};
use crate::error::PipelineError;
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

const STAGE: &str = "augmentation";

/// Rows generated between cancellation checks.
const CHECK_EVERY: usize = 256;

/// Class counts before and after class balancing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassBalance {
    pub target_column: String,
    pub before: BTreeMap<String, usize>,
    pub after: BTreeMap<String, usize>,
}

/// Mutable state shared with a strategy while it generates rows.
pub struct GenerationContext {
    pub rng: StdRng,
    pub cancel: CancellationToken,
    pub warnings: Vec<String>,
    pub class_balance: Option<ClassBalance>,
}

impl GenerationContext {
    pub fn new(rng: StdRng, cancel: CancellationToken) -> Self {
        Self {
            rng,
            cancel,
            warnings: Vec::new(),
            class_balance: None,
        }
    }

    fn checkpoint(&self, produced: usize) -> Result<(), PipelineError> {
        if produced % CHECK_EVERY == 0 && self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    fn warn(&mut self, message: String) {
        tracing::warn!(%message, "Augmentation fallback");
        self.warnings.push(message);
    }
}

/// A synthetic row generator.
///
/// `generate` returns new rows in table column order; it never modifies the
/// input. `requested` is the number of rows asked for; class-balancing
/// strategies derive their own count from the class distribution.
pub trait Augmenter: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate(
        &self,
        table: &Table,
        requested: usize,
        ctx: &mut GenerationContext,
    ) -> Result<Vec<Vec<Cell>>, PipelineError>;
}

fn numeric_mask(table: &Table) -> Vec<bool> {
    table.columns().iter().map(|c| c.dtype().is_numeric()).collect()
}

/// `weight * a + (1 - weight) * b` on numeric columns; other columns come from
/// the parent with the larger weight.
fn blend(a: &[Cell], b: &[Cell], weight: f64, numeric: &[bool]) -> Vec<Cell> {
    a.iter()
        .zip(b)
        .zip(numeric)
        .map(|((x, y), is_numeric)| {
            if *is_numeric {
                match (x.as_f64(), y.as_f64()) {
                    (Some(x), Some(y)) => Cell::Float(weight * x + (1.0 - weight) * y),
                    _ => Cell::Null,
                }
            } else if weight >= 0.5 {
                x.clone()
            } else {
                y.clone()
            }
        })
        .collect()
}

fn require_rows(table: &Table, method: &str) -> Result<(), PipelineError> {
    if table.row_count() == 0 {
        return Err(PipelineError::stage(
            STAGE,
            format!("{method} needs at least one row"),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Mixup
// ---------------------------------------------------------------------------

/// Convex combinations of random row pairs with Beta(alpha, alpha) weights.
pub struct Mixup {
    pub alpha: f64,
}

impl Augmenter for Mixup {
    fn name(&self) -> &'static str {
        "mixup"
    }

    fn generate(
        &self,
        table: &Table,
        requested: usize,
        ctx: &mut GenerationContext,
    ) -> Result<Vec<Vec<Cell>>, PipelineError> {
        if requested == 0 {
            return Ok(Vec::new());
        }
        require_rows(table, self.name())?;
        let numeric = numeric_mask(table);
        let rows = table.row_count();
        let mut out = Vec::with_capacity(requested);
        for k in 0..requested {
            ctx.checkpoint(k)?;
            let a = table.row(ctx.rng.gen_range(0..rows));
            let b = table.row(ctx.rng.gen_range(0..rows));
            let weight = beta(&mut ctx.rng, self.alpha, self.alpha);
            out.push(blend(&a, &b, weight, &numeric));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// RandomInterpolation
// ---------------------------------------------------------------------------

/// Points on the segment between two random rows.
pub struct RandomInterpolation;

impl Augmenter for RandomInterpolation {
    fn name(&self) -> &'static str {
        "random_interpolation"
    }

    fn generate(
        &self,
        table: &Table,
        requested: usize,
        ctx: &mut GenerationContext,
    ) -> Result<Vec<Vec<Cell>>, PipelineError> {
        if requested == 0 {
            return Ok(Vec::new());
        }
        require_rows(table, self.name())?;
        let numeric = numeric_mask(table);
        let rows = table.row_count();
        let mut out = Vec::with_capacity(requested);
        for k in 0..requested {
            ctx.checkpoint(k)?;
            let a = table.row(ctx.rng.gen_range(0..rows));
            let b = table.row(ctx.rng.gen_range(0..rows));
            let alpha: f64 = ctx.rng.r#gen::<f64>();
            out.push(blend(&a, &b, 1.0 - alpha, &numeric));
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// GaussianNoise
// ---------------------------------------------------------------------------

/// Random rows with N(0, scale * std) noise added per numeric column.
pub struct GaussianNoise {
    pub scale: f64,
}

impl Augmenter for GaussianNoise {
    fn name(&self) -> &'static str {
        "gaussian_noise"
    }

    fn generate(
        &self,
        table: &Table,
        requested: usize,
        ctx: &mut GenerationContext,
    ) -> Result<Vec<Vec<Cell>>, PipelineError> {
        if requested == 0 {
            return Ok(Vec::new());
        }
        require_rows(table, self.name())?;
        let stds: Vec<Option<f64>> = table
            .columns()
            .iter()
            .map(|c| {
                c.dtype()
                    .is_numeric()
                    .then(|| sample_std(&c.data.present_f64()))
                    .flatten()
            })
            .collect();
        let rows = table.row_count();
        let mut out = Vec::with_capacity(requested);
        for k in 0..requested {
            ctx.checkpoint(k)?;
            let mut row = table.row(ctx.rng.gen_range(0..rows));
            for (cell, std) in row.iter_mut().zip(&stds) {
                if let (Some(x), Some(std)) = (cell.as_f64(), std) {
                    *cell = Cell::Float(x + normal(&mut ctx.rng, 0.0, self.scale * std));
                }
            }
            out.push(row);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// TimeWarp
// ---------------------------------------------------------------------------

/// Resamples the series at jittered positions along its time axis.
pub struct TimeWarp {
    /// Explicit time column; the first datetime column otherwise.
    pub time_column: Option<String>,
    pub jitter_std: f64,
}

impl TimeWarp {
    fn time_index(&self, table: &Table) -> Result<usize, PipelineError> {
        let is_time = |dtype: DataType| dtype == DataType::DateTime;
        match &self.time_column {
            Some(name) => table
                .columns()
                .iter()
                .position(|c| c.name == *name && is_time(c.dtype()))
                .ok_or_else(|| {
                    PipelineError::stage(STAGE, format!("time column '{name}' is not a datetime column"))
                }),
            None => table
                .columns()
                .iter()
                .position(|c| is_time(c.dtype()))
                .ok_or_else(|| PipelineError::stage(STAGE, "time_warp requires a datetime column")),
        }
    }
}

fn catmull_rom(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * (2.0 * p1
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
}

impl Augmenter for TimeWarp {
    fn name(&self) -> &'static str {
        "time_warp"
    }

    fn generate(
        &self,
        table: &Table,
        requested: usize,
        ctx: &mut GenerationContext,
    ) -> Result<Vec<Vec<Cell>>, PipelineError> {
        let time_idx = self.time_index(table)?;
        let ColumnData::DateTime(times) = &table.columns()[time_idx].data else {
            return Err(PipelineError::stage(STAGE, "time column is not a datetime column"));
        };
        if requested == 0 {
            return Ok(Vec::new());
        }

        let mut order: Vec<_> = times
            .iter()
            .enumerate()
            .filter_map(|(i, t)| Some(((*t)?, i)))
            .collect();
        order.sort();
        if order.len() < 2 {
            return Err(PipelineError::stage(
                STAGE,
                "time_warp needs at least two timestamped rows",
            ));
        }
        let series: Vec<Vec<Cell>> = order.iter().map(|(_, i)| table.row(*i)).collect();
        let numeric = numeric_mask(table);
        let m = series.len();

        let mut out = Vec::with_capacity(requested);
        for k in 0..requested {
            ctx.checkpoint(k)?;
            let base = ctx.rng.gen_range(0..m) as f64;
            let pos = (base + normal(&mut ctx.rng, 0.0, self.jitter_std)).clamp(0.0, (m - 1) as f64);
            let (i, t) = if pos as usize >= m - 1 {
                (m - 2, 1.0)
            } else {
                (pos as usize, pos.fract())
            };
            let p0 = &series[i.saturating_sub(1)];
            let p1 = &series[i];
            let p2 = &series[i + 1];
            let p3 = &series[(i + 2).min(m - 1)];

            let row = (0..numeric.len())
                .map(|j| {
                    if j == time_idx {
                        let (t1, t2) = (order[i].0, order[i + 1].0);
                        let span = (t2 - t1).num_milliseconds() as f64;
                        return Cell::DateTime(
                            t1 + chrono::Duration::milliseconds((span * t).round() as i64),
                        );
                    }
                    if !numeric[j] {
                        return if t < 0.5 { p1[j].clone() } else { p2[j].clone() };
                    }
                    match (p1[j].as_f64(), p2[j].as_f64()) {
                        (Some(y1), Some(y2)) => {
                            let y0 = p0[j].as_f64().unwrap_or(y1);
                            let y3 = p3[j].as_f64().unwrap_or(y2);
                            Cell::Float(catmull_rom(y0, y1, y2, y3, t))
                        }
                        _ => Cell::Null,
                    }
                })
                .collect();
            out.push(row);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Class balancing: Smote and RandomOversampling
// ---------------------------------------------------------------------------

struct ClassGroups {
    target_idx: usize,
    /// Class key to member row indices, in key order.
    members: BTreeMap<String, Vec<usize>>,
    majority: usize,
}

fn class_groups(table: &Table, target: &str) -> Result<ClassGroups, PipelineError> {
    let target_idx = table
        .columns()
        .iter()
        .position(|c| c.name == target)
        .ok_or_else(|| PipelineError::stage(STAGE, format!("target column '{target}' not found")))?;
    let data = &table.columns()[target_idx].data;
    let mut members: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for i in 0..table.row_count() {
        let cell = data.cell(i);
        if !cell.is_null() {
            members.entry(cell.key()).or_default().push(i);
        }
    }
    let majority = members.values().map(Vec::len).max().unwrap_or(0);
    Ok(ClassGroups {
        target_idx,
        members,
        majority,
    })
}

fn record_balance(ctx: &mut GenerationContext, target: &str, groups: &ClassGroups) {
    let before: BTreeMap<String, usize> = groups
        .members
        .iter()
        .map(|(k, v)| (k.clone(), v.len()))
        .collect();
    let after = before.keys().map(|k| (k.clone(), groups.majority)).collect();
    ctx.class_balance = Some(ClassBalance {
        target_column: target.to_string(),
        before,
        after,
    });
}

fn oversample(
    table: &Table,
    members: &[usize],
    need: usize,
    ctx: &mut GenerationContext,
    out: &mut Vec<Vec<Cell>>,
) -> Result<(), PipelineError> {
    for k in 0..need {
        ctx.checkpoint(k)?;
        let pick = members[ctx.rng.gen_range(0..members.len())];
        out.push(table.row(pick));
    }
    Ok(())
}

/// Synthetic minority oversampling: interpolates between a class member and
/// one of its nearest same-class neighbours until every class matches the
/// majority count.
pub struct Smote {
    pub target_column: String,
    pub k_neighbors: usize,
}

impl Smote {
    fn distance(a: &[Cell], b: &[Cell], features: &[usize]) -> f64 {
        let mut sum = 0.0;
        let mut used = 0;
        for &j in features {
            if let (Some(x), Some(y)) = (a[j].as_f64(), b[j].as_f64()) {
                sum += (x - y).powi(2);
                used += 1;
            }
        }
        if used == 0 { f64::INFINITY } else { sum.sqrt() }
    }

    fn neighbours(&self, rows: &[Vec<Cell>], features: &[usize]) -> Vec<Vec<usize>> {
        (0..rows.len())
            .map(|i| {
                let mut others: Vec<(f64, usize)> = (0..rows.len())
                    .filter(|&j| j != i)
                    .map(|j| (Self::distance(&rows[i], &rows[j], features), j))
                    .collect();
                others.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                others.truncate(self.k_neighbors.max(1));
                others.into_iter().map(|(_, j)| j).collect()
            })
            .collect()
    }
}

impl Augmenter for Smote {
    fn name(&self) -> &'static str {
        "smote"
    }

    fn generate(
        &self,
        table: &Table,
        _requested: usize,
        ctx: &mut GenerationContext,
    ) -> Result<Vec<Vec<Cell>>, PipelineError> {
        let groups = class_groups(table, &self.target_column)?;
        let features: Vec<usize> = table
            .columns()
            .iter()
            .enumerate()
            .filter(|(j, c)| *j != groups.target_idx && c.dtype().is_numeric())
            .map(|(j, _)| j)
            .collect();

        let mut out = Vec::new();
        for (class, members) in &groups.members {
            let need = groups.majority - members.len();
            if need == 0 {
                continue;
            }
            if members.len() < 2 || features.is_empty() {
                let reason = if features.is_empty() {
                    "no numeric features"
                } else {
                    "a single sample"
                };
                ctx.warn(format!(
                    "SMOTE fell back to random oversampling for class '{class}': {reason}"
                ));
                oversample(table, members, need, ctx, &mut out)?;
                continue;
            }

            let rows: Vec<Vec<Cell>> = members.iter().map(|&i| table.row(i)).collect();
            let neighbours = self.neighbours(&rows, &features);
            for k in 0..need {
                ctx.checkpoint(k)?;
                let s = ctx.rng.gen_range(0..rows.len());
                let n = neighbours[s][ctx.rng.gen_range(0..neighbours[s].len())];
                let gap: f64 = ctx.rng.r#gen::<f64>();
                let mut row = rows[s].clone();
                for &j in &features {
                    if let (Some(x), Some(y)) = (rows[s][j].as_f64(), rows[n][j].as_f64()) {
                        row[j] = Cell::Float(x + gap * (y - x));
                    }
                }
                out.push(row);
            }
        }

        record_balance(ctx, &self.target_column, &groups);
        Ok(out)
    }
}

/// Duplicates random minority-class rows until classes are balanced.
pub struct RandomOversampling {
    pub target_column: String,
}

impl Augmenter for RandomOversampling {
    fn name(&self) -> &'static str {
        "random_oversampling"
    }

    fn generate(
        &self,
        table: &Table,
        _requested: usize,
        ctx: &mut GenerationContext,
    ) -> Result<Vec<Vec<Cell>>, PipelineError> {
        let groups = class_groups(table, &self.target_column)?;
        let mut out = Vec::new();
        for members in groups.members.values() {
            let need = groups.majority - members.len();
            oversample(table, members, need, ctx, &mut out)?;
        }
        record_balance(ctx, &self.target_column, &groups);
        Ok(out)
    }
}

pub(crate) fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let ss: f64 = values.iter().map(|x| (x - mean).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::table::Column;
    use chrono::{TimeZone, Utc};
    use rand::SeedableRng;

    fn ctx(seed: u64) -> GenerationContext {
        GenerationContext::new(StdRng::seed_from_u64(seed), CancellationToken::new())
    }

    #[test]
    fn test_blend_copies_non_numeric_from_dominant_parent() {
        let a = vec![Cell::Float(0.0), Cell::String("a".into())];
        let b = vec![Cell::Float(10.0), Cell::String("b".into())];
        let mixed = blend(&a, &b, 0.25, &[true, false]);
        assert_eq!(mixed, vec![Cell::Float(7.5), Cell::String("b".into())]);
    }

    #[test]
    fn test_interpolation_stays_within_bounds() {
        let table = Table::new(vec![Column::float("x", vec![Some(0.0), Some(10.0)])]).unwrap();
        let rows = RandomInterpolation.generate(&table, 50, &mut ctx(1)).unwrap();
        assert_eq!(rows.len(), 50);
        for row in rows {
            let x = row[0].as_f64().unwrap();
            assert!((0.0..=10.0).contains(&x));
        }
    }

    #[test]
    fn test_noise_keeps_missing_values_missing() {
        let table = Table::new(vec![Column::float("x", vec![None, None])]).unwrap();
        let rows = GaussianNoise { scale: 0.1 }
            .generate(&table, 3, &mut ctx(2))
            .unwrap();
        assert!(rows.iter().all(|r| r[0].is_null()));
    }

    #[test]
    fn test_catmull_rom_hits_control_points() {
        assert_eq!(catmull_rom(0.0, 1.0, 2.0, 3.0, 0.0), 1.0);
        assert_eq!(catmull_rom(0.0, 1.0, 2.0, 3.0, 1.0), 2.0);
        assert!((catmull_rom(0.0, 1.0, 2.0, 3.0, 0.5) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_time_warp_timestamps_stay_in_range() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let times = (0..10).map(|d| Some(start + chrono::Duration::days(d))).collect();
        let table = Table::new(vec![
            Column::datetime("ts", times),
            Column::float("v", (0..10).map(|i| Some(i as f64)).collect()),
        ])
        .unwrap();
        let warp = TimeWarp {
            time_column: None,
            jitter_std: 2.0,
        };
        let rows = warp.generate(&table, 20, &mut ctx(5)).unwrap();
        for row in rows {
            let Cell::DateTime(ts) = row[0] else {
                panic!("expected timestamp");
            };
            assert!(ts >= start && ts <= start + chrono::Duration::days(9));
        }
    }

    #[test]
    fn test_time_warp_without_datetime_fails() {
        let table = Table::new(vec![Column::float("v", vec![Some(1.0), Some(2.0)])]).unwrap();
        let warp = TimeWarp {
            time_column: None,
            jitter_std: 2.0,
        };
        let err = warp.generate(&table, 1, &mut ctx(0)).unwrap_err();
        assert!(err.to_string().contains("requires a datetime column"));
    }

    #[test]
    fn test_smote_interpolates_within_class() {
        let table = Table::new(vec![
            Column::float("f", vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0), Some(10.0), Some(11.0)]),
            Column::string("y", vec![Some("a"), Some("a"), Some("a"), Some("a"), Some("b"), Some("b")]),
        ])
        .unwrap();
        let smote = Smote {
            target_column: "y".into(),
            k_neighbors: 5,
        };
        let mut ctx = ctx(9);
        let rows = smote.generate(&table, 0, &mut ctx).unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row[1], Cell::String("b".into()));
            let f = row[0].as_f64().unwrap();
            assert!((10.0..=11.0).contains(&f));
        }
        let balance = ctx.class_balance.unwrap();
        assert_eq!(balance.before["b"], 2);
        assert_eq!(balance.after["b"], 4);
        assert!(ctx.warnings.is_empty());
    }

    #[test]
    fn test_smote_single_sample_falls_back_with_warning() {
        let table = Table::new(vec![
            Column::float("f", vec![Some(0.0), Some(1.0), Some(5.0)]),
            Column::integer("y", vec![Some(0), Some(0), Some(1)]),
        ])
        .unwrap();
        let smote = Smote {
            target_column: "y".into(),
            k_neighbors: 5,
        };
        let mut ctx = ctx(4);
        let rows = smote.generate(&table, 0, &mut ctx).unwrap();
        assert_eq!(rows, vec![vec![Cell::Float(5.0), Cell::Integer(1)]]);
        assert_eq!(ctx.warnings.len(), 1);
        assert!(ctx.warnings[0].contains("random oversampling"));
    }

    #[test]
    fn test_random_oversampling_duplicates_members() {
        let table = Table::new(vec![Column::string(
            "y",
            vec![Some("a"), Some("a"), Some("a"), Some("b")],
        )])
        .unwrap();
        let rows = RandomOversampling {
            target_column: "y".into(),
        }
        .generate(&table, 0, &mut ctx(1))
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r[0] == Cell::String("b".into())));
    }

    #[test]
    fn test_cancelled_generation_stops() {
        let table = Table::new(vec![Column::float("x", vec![Some(1.0)])]).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut ctx = GenerationContext::new(StdRng::seed_from_u64(0), token);
        let err = Mixup { alpha: 0.4 }.generate(&table, 10, &mut ctx).unwrap_err();
        assert!(err.is_cancelled());
    }
}
