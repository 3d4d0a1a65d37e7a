//! Aggregators over the filtered log stream: `count`, `avg`, `max`, `min`,
//! `sum`. All of them produce integers; `avg`/`max`/`min`/`sum` take an
//! integer-typed column and an optional condition, `count` takes just the
//! optional condition.

use crate::model::{Column, LoadPlan, LogRecord, ValueType};
use crate::query::condition::{self, Condition};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrKind {
    Count,
    Avg,
    Max,
    Min,
    Sum,
}

impl AggrKind {
    fn parse(name: &str) -> Option<AggrKind> {
        match name {
            "count" => Some(AggrKind::Count),
            "avg" => Some(AggrKind::Avg),
            "max" => Some(AggrKind::Max),
            "min" => Some(AggrKind::Min),
            "sum" => Some(AggrKind::Sum),
            _ => None,
        }
    }
}

pub fn is_known_aggregator(name: &str) -> bool {
    AggrKind::parse(name).is_some()
}

/// Whether a select entry is an aggregator expression rather than a column.
pub fn is_aggr_expr(entry: &str) -> bool {
    entry.ends_with(']')
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    kind: AggrKind,
    column: Option<Column>,
    condition: Option<Condition>,
    count: i64,
    sum: i64,
    min: i64,
    max: i64,
}

impl Aggregator {
    fn new(kind: AggrKind, column: Option<Column>, condition: Option<Condition>) -> Aggregator {
        Aggregator {
            kind,
            column,
            condition,
            count: 0,
            sum: 0,
            min: i64::MAX,
            max: i64::MIN,
        }
    }

    /// A copy with the same shape and zeroed accumulators, for a new group.
    pub fn fresh(&self) -> Aggregator {
        Aggregator::new(self.kind, self.column, self.condition.clone())
    }

    pub fn update(&mut self, log: &LogRecord) -> Result<()> {
        if let Some(condition) = &self.condition {
            if !condition.check(log)? {
                return Ok(());
            }
        }
        if self.kind == AggrKind::Count {
            self.count += 1;
            return Ok(());
        }

        let column = self
            .column
            .ok_or_else(|| Error::Internal("aggregator without a column".to_string()))?;
        let value = log
            .value(column)
            .as_int()
            .ok_or_else(|| Error::Internal(format!("aggregator column '{column}' not integer")))?;

        match self.kind {
            AggrKind::Avg => {
                self.sum += value;
                self.count += 1;
            }
            AggrKind::Sum => self.sum += value,
            AggrKind::Max => self.max = self.max.max(value),
            AggrKind::Min => self.min = self.min.min(value),
            AggrKind::Count => unreachable!(),
        }
        Ok(())
    }

    pub fn result(&self) -> i64 {
        match self.kind {
            AggrKind::Count => self.count,
            AggrKind::Sum => self.sum,
            AggrKind::Max => self.max,
            AggrKind::Min => self.min,
            AggrKind::Avg => {
                if self.count == 0 {
                    0
                } else {
                    self.sum / self.count
                }
            }
        }
    }
}

/// Parse an aggregator expression like `count[]`, `sum[level, level > ?0]`,
/// or `max[timestamp]`. Condition arguments draw from `values` and record
/// touched columns into `plan`.
pub fn parse(
    expr: &str,
    values: &[serde_json::Value],
    mut plan: Option<&mut LoadPlan>,
) -> Result<Aggregator> {
    let invalid = || Error::bad_request(format!("Invalid aggregator: {expr}"));

    let open = expr.find('[').ok_or_else(invalid)?;
    if !expr.ends_with(']') {
        return Err(invalid());
    }
    let kind = AggrKind::parse(&expr[..open])
        .ok_or_else(|| Error::bad_request(format!("Incorrect aggregator: {expr}")))?;

    let body = &expr[open + 1..expr.len() - 1];
    let args: Vec<&str> = if body.trim().is_empty() {
        Vec::new()
    } else {
        body.split(',').map(str::trim).collect()
    };

    if kind == AggrKind::Count {
        if args.len() > 1 {
            return Err(Error::bad_request(format!(
                "Extra arguments in 'count' aggregator: {expr}"
            )));
        }
        let cond = args
            .first()
            .map(|arg| condition::parse(arg, values, None, plan))
            .transpose()?;
        return Ok(Aggregator::new(kind, None, cond));
    }

    if args.is_empty() || args.len() > 2 {
        return Err(invalid());
    }
    let column = Column::parse(args[0])
        .filter(|c| c.value_type() == ValueType::Int)
        .ok_or_else(|| {
            Error::bad_request(format!("Incorrect log column in aggregator: {expr}"))
        })?;
    if let Some(plan) = plan.as_deref_mut() {
        plan.columns.insert(column);
    }

    let cond = args
        .get(1)
        .map(|arg| condition::parse(arg, values, None, plan))
        .transpose()?;
    Ok(Aggregator::new(kind, Some(column), cond))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log_with_level(level: u8) -> LogRecord {
        LogRecord {
            timestamp: i64::from(level) + 1,
            level,
            ..LogRecord::default()
        }
    }

    #[test]
    fn parses_each_shape() {
        assert!(parse("count[]", &[], None).is_ok());
        assert!(parse("min[level]", &[], None).is_ok());
        assert!(parse("avg[level]", &[], None).is_ok());
        assert!(parse("max[timestamp, ?0 > ?1]", &[json!(7), json!(5)], None).is_ok());
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(parse("abc[level]", &[], None).is_err());
        assert!(parse("max[message]", &[], None).is_err());
        assert!(parse("max[level, a, b, c]", &[], None).is_err());
        assert!(parse("count[", &[], None).is_err());
        assert!(parse("sum[]", &[], None).is_err());
    }

    #[test]
    fn count_with_condition_filters() {
        let mut aggr = parse("count[level > ?0]", &[json!(1)], None).unwrap();
        for level in 0..4 {
            aggr.update(&log_with_level(level)).unwrap();
        }
        assert_eq!(aggr.result(), 2);
    }

    #[test]
    fn sum_min_max_avg() {
        let logs: Vec<LogRecord> = (1..=4).map(log_with_level).collect();

        let mut sum = parse("sum[level]", &[], None).unwrap();
        let mut min = parse("min[level]", &[], None).unwrap();
        let mut max = parse("max[level]", &[], None).unwrap();
        let mut avg = parse("avg[level]", &[], None).unwrap();
        for log in &logs {
            sum.update(log).unwrap();
            min.update(log).unwrap();
            max.update(log).unwrap();
            avg.update(log).unwrap();
        }

        assert_eq!(sum.result(), 10);
        assert_eq!(min.result(), 1);
        assert_eq!(max.result(), 4);
        assert_eq!(avg.result(), 2);
    }

    #[test]
    fn empty_avg_is_zero() {
        let avg = parse("avg[level]", &[], None).unwrap();
        assert_eq!(avg.result(), 0);
    }

    #[test]
    fn fresh_resets_accumulators() {
        let mut aggr = parse("sum[level]", &[], None).unwrap();
        aggr.update(&log_with_level(3)).unwrap();
        assert_eq!(aggr.result(), 3);
        assert_eq!(aggr.fresh().result(), 0);
    }

    #[test]
    fn aggregator_records_plan_columns() {
        let mut plan = LoadPlan::default();
        parse("sum[level, timestamp > ?0]", &[json!(1)], Some(&mut plan)).unwrap();
        assert!(plan.columns.contains(Column::Level));
        assert!(plan.columns.contains(Column::Timestamp));
    }
}
