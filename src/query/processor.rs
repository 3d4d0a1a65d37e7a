//! The search pipeline: parse a query into a load plan, fold chunk packs
//! through filters, aggregators, and groups, then project ordered result
//! rows.

use crate::model::{Column, LoadPlan, LogRecord, SearchQuery, Value, ValueSource};
use crate::query::aggregate::{self, Aggregator};
use crate::query::condition::{self, Condition, HavingContext};
use crate::query::time_range;
use crate::{Error, Result};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};

/// A grouped result row: the grouping value plus every aggregator result,
/// addressable by column name or aggregator expression.
pub struct AggrSource {
    values: BTreeMap<String, Value>,
}

impl ValueSource for AggrSource {
    fn lookup(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

struct GroupEntry {
    value: Value,
    aggrs: BTreeMap<String, Aggregator>,
}

struct Groups {
    group_by: Column,
    template: BTreeMap<String, Aggregator>,
    having: Option<Condition>,
    groups: BTreeMap<String, GroupEntry>,
}

impl Groups {
    fn update(&mut self, log: &LogRecord) -> Result<()> {
        let value = log.value(self.group_by);
        let key = value.group_key();

        let template = &self.template;
        let entry = self.groups.entry(key).or_insert_with(|| GroupEntry {
            value,
            aggrs: template
                .iter()
                .map(|(name, aggr)| (name.clone(), aggr.fresh()))
                .collect(),
        });
        for aggr in entry.aggrs.values_mut() {
            aggr.update(log)?;
        }
        Ok(())
    }

    fn sources(&self) -> Result<Vec<AggrSource>> {
        let mut sources = Vec::with_capacity(self.groups.len());

        for entry in self.groups.values() {
            let mut values = BTreeMap::new();
            values.insert(self.group_by.name().to_string(), entry.value.clone());
            for (name, aggr) in &entry.aggrs {
                values.insert(name.clone(), Value::Int(aggr.result()));
            }
            let source = AggrSource { values };

            if let Some(having) = &self.having {
                if !having.check(&source)? {
                    continue;
                }
            }
            sources.push(source);
        }
        Ok(sources)
    }
}

pub struct Processor {
    query: SearchQuery,
    where_cond: Option<Condition>,
    aggrs: BTreeMap<String, Aggregator>,
    groups: Option<Groups>,
    log_packs: Vec<Vec<LogRecord>>,
}

impl Processor {
    /// Parse and validate the query. Returns the processor and the load plan
    /// describing which columns and time window the reader must fetch.
    pub fn new(query: SearchQuery) -> Result<(Processor, LoadPlan)> {
        if query.storage.is_empty() {
            return Err(Error::bad_request("'storage' not specified"));
        }
        let mut plan = LoadPlan {
            storage: query.storage.clone(),
            ..LoadPlan::default()
        };
        plan.time_range = time_range::parse(&query.time_range)?;

        let where_cond = if query.r#where.is_empty() {
            None
        } else {
            Some(condition::parse(
                &query.r#where,
                &query.where_values,
                None,
                Some(&mut plan),
            )?)
        };

        // Select entries: aggregators, columns, or literal passthrough.
        let mut aggrs = BTreeMap::new();
        for entry in &query.select {
            let entry = entry.trim();
            if aggregate::is_aggr_expr(entry) {
                let aggr = aggregate::parse(entry, &query.aggreg_values, Some(&mut plan))?;
                aggrs.insert(entry.to_string(), aggr);
            } else if let Some(column) = Column::parse(entry) {
                if !query.group_by.is_empty() && query.group_by != entry {
                    return Err(Error::bad_request(format!(
                        "Incorrect column in 'select': {entry}"
                    )));
                }
                plan.columns.insert(column);
            }
        }

        // Grouping and the having condition, which may register more
        // aggregators as it parses.
        let groups = if query.group_by.is_empty() {
            None
        } else {
            let group_by = Column::parse(&query.group_by)
                .filter(|c| *c != Column::Fields)
                .ok_or_else(|| {
                    Error::bad_request(format!("Incorrect column 'group_by': {}", query.group_by))
                })?;
            plan.columns.insert(group_by);

            let having = if query.having.is_empty() {
                None
            } else {
                let mut ctx = HavingContext {
                    group_by,
                    aggregators: &mut aggrs,
                    aggreg_values: &query.aggreg_values,
                };
                Some(condition::parse(
                    &query.having,
                    &query.having_values,
                    Some(&mut ctx),
                    Some(&mut plan),
                )?)
            };

            Some(Groups {
                group_by,
                template: std::mem::take(&mut aggrs),
                having,
                groups: BTreeMap::new(),
            })
        };

        validate_order_by(&query, groups.as_ref())?;

        Ok((
            Processor {
                query,
                where_cond,
                aggrs,
                groups,
                log_packs: Vec::new(),
            },
            plan,
        ))
    }

    /// Fold one chunk pack into the pipeline.
    pub fn put_logs(&mut self, logs: Vec<LogRecord>) -> Result<()> {
        let mut pack = Vec::new();

        for log in logs {
            if let Some(cond) = &self.where_cond {
                if !cond.check(&log)? {
                    continue;
                }
            }
            match &mut self.groups {
                Some(groups) => groups.update(&log)?,
                None => {
                    for aggr in self.aggrs.values_mut() {
                        aggr.update(&log)?;
                    }
                    pack.push(log);
                }
            }
        }
        if !pack.is_empty() {
            self.log_packs.push(pack);
        }
        Ok(())
    }

    /// Drain the reader's channel, then surface its terminal error.
    pub async fn collect(
        &mut self,
        logs_rx: &mut mpsc::Receiver<Vec<LogRecord>>,
        reply: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        while let Some(pack) = logs_rx.recv().await {
            self.put_logs(pack)?;
        }
        reply
            .await
            .map_err(|_| Error::Internal("reader dropped the reply channel".to_string()))?
    }

    /// Produce the final ordered, sliced, projected rows.
    pub fn into_rows(mut self) -> Result<Vec<Vec<Value>>> {
        match self.groups.take() {
            Some(groups) => self.rows_from_groups(groups),
            None => self.rows_from_logs(),
        }
    }

    fn rows_from_logs(self) -> Result<Vec<Vec<Value>>> {
        let Processor {
            query,
            aggrs,
            log_packs,
            ..
        } = self;

        let logs = sort_logs(log_packs, &query.order_by)?;
        let logs = slice_page(logs, query.offset, query.limit);

        let rows = logs
            .iter()
            .map(|log| {
                query
                    .select
                    .iter()
                    .map(|entry| {
                        let entry = entry.trim();
                        if let Some(column) = Column::parse(entry) {
                            log.value(column)
                        } else if let Some(aggr) = aggrs.get(entry) {
                            Value::Int(aggr.result())
                        } else {
                            Value::Str(entry.to_string())
                        }
                    })
                    .collect()
            })
            .collect();
        Ok(rows)
    }

    fn rows_from_groups(self, groups: Groups) -> Result<Vec<Vec<Value>>> {
        let mut sources = groups.sources()?;
        sort_groups(&mut sources, &self.query.order_by)?;
        let sources = slice_page(sources, self.query.offset, self.query.limit);

        let rows = sources
            .iter()
            .map(|source| {
                self.query
                    .select
                    .iter()
                    .map(|entry| {
                        let entry = entry.trim();
                        source
                            .lookup(entry)
                            .unwrap_or_else(|| Value::Str(entry.to_string()))
                    })
                    .collect()
            })
            .collect();
        Ok(rows)
    }
}

fn validate_order_by(query: &SearchQuery, groups: Option<&Groups>) -> Result<()> {
    if query.order_by.is_empty() {
        return Ok(());
    }
    let key = query.order_by.strip_prefix('-').unwrap_or(&query.order_by);

    let passes = if key == Column::Fields.name() {
        false
    } else if let Some(groups) = groups {
        groups.template.contains_key(key) || key == groups.group_by.name()
    } else {
        Column::parse(key).is_some()
    };

    if !passes {
        return Err(Error::bad_request(format!(
            "Incorrect column 'order_by': {}",
            query.order_by
        )));
    }
    Ok(())
}

fn slice_page<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    if offset >= items.len() {
        return Vec::new();
    }
    let end = if limit == 0 {
        items.len()
    } else {
        (offset + limit).min(items.len())
    };
    items.into_iter().take(end).skip(offset).collect()
}

/// Merge chunk packs into one ordered list. Packs whose time ranges do not
/// cross concatenate as-is; runs of crossing packs are pooled and
/// stable-sorted. A non-timestamp key sorts the joined list by that column.
fn sort_logs(mut packs: Vec<Vec<LogRecord>>, order_by: &str) -> Result<Vec<LogRecord>> {
    if packs.is_empty() {
        return Ok(Vec::new());
    }
    let descending = order_by.starts_with('-');
    let key = order_by.strip_prefix('-').unwrap_or(order_by);

    if key.is_empty() || key == Column::Timestamp.name() {
        packs.sort_by_key(|pack| pack[0].timestamp);

        let mut logs: Vec<LogRecord> = Vec::with_capacity(packs.iter().map(Vec::len).sum());
        let mut run: Vec<Vec<LogRecord>> = Vec::new();

        for pack in packs {
            let crosses = run
                .last()
                .is_some_and(|prev| prev[prev.len() - 1].timestamp >= pack[0].timestamp);
            if !crosses {
                flush_run(&mut logs, std::mem::take(&mut run));
            }
            run.push(pack);
        }
        flush_run(&mut logs, run);

        if descending {
            logs.reverse();
        }
        return Ok(logs);
    }

    let column = Column::parse(key)
        .ok_or_else(|| Error::bad_request(format!("Cannot order by column: {key}")))?;
    let mut logs: Vec<LogRecord> = packs.into_iter().flatten().collect();
    sort_by_value(&mut logs, |log| log.value(column), descending)?;
    Ok(logs)
}

fn flush_run(out: &mut Vec<LogRecord>, run: Vec<Vec<LogRecord>>) {
    if run.len() > 1 {
        let mut pooled: Vec<LogRecord> = run.into_iter().flatten().collect();
        pooled.sort_by_key(|l| l.timestamp);
        out.extend(pooled);
    } else {
        out.extend(run.into_iter().flatten());
    }
}

fn sort_groups(sources: &mut Vec<AggrSource>, order_by: &str) -> Result<()> {
    if sources.len() < 2 || order_by.is_empty() {
        return Ok(());
    }
    let descending = order_by.starts_with('-');
    let key = order_by.strip_prefix('-').unwrap_or(order_by);

    let key_owned = key.to_string();
    sort_by_value(
        sources,
        move |source| source.lookup(&key_owned).unwrap_or(Value::Int(0)),
        descending,
    )
}

fn sort_by_value<T>(
    items: &mut [T],
    value_of: impl Fn(&T) -> Value,
    descending: bool,
) -> Result<()> {
    match value_of(&items[0]) {
        Value::Int(_) => {
            items.sort_by_key(|item| value_of(item).as_int().unwrap_or(0));
        }
        Value::Str(_) | Value::StrArray(_) | Value::IntArray(_) => {
            items.sort_by_cached_key(|item| value_of(item).group_key());
        }
        Value::StrMap(_) => {
            return Err(Error::bad_request("Cannot order by a map-valued column"));
        }
    }
    if descending {
        items.reverse();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnSet;
    use serde_json::json;

    fn sample_logs() -> Vec<LogRecord> {
        let rows = [
            ("log1", "trace1", 0u8, &["m1", "m2"], 1i64),
            ("log2", "trace1", 1, &["m2", "m3"], 2),
            ("log3", "trace2", 2, &["m3", "m4"], 3),
            ("log4", "trace2", 3, &["m4", "m5"], 4),
        ];
        rows.iter()
            .map(|(entity, trace, level, modules, ts)| LogRecord {
                timestamp: *ts,
                level: *level,
                entity: (*entity).into(),
                traces: vec![(*trace).into()],
                modules: modules.iter().map(|m| m.to_string()).collect(),
                ..LogRecord::default()
            })
            .collect()
    }

    #[test]
    fn plain_query_filters_and_orders() {
        let query = SearchQuery {
            storage: "storage".into(),
            select: vec!["entity".into(), "modules".into()],
            r#where: "level >= ?0 & level != ?1".into(),
            where_values: vec![json!(1), json!(2)],
            order_by: "entity".into(),
            ..SearchQuery::default()
        };
        let (mut proc, plan) = Processor::new(query).unwrap();

        let mut expected_columns = ColumnSet::default();
        expected_columns.insert(Column::Level);
        expected_columns.insert(Column::Entity);
        expected_columns.insert(Column::Modules);
        assert_eq!(plan.columns, expected_columns);
        assert_eq!(plan.storage, "storage");

        let logs = sample_logs();
        proc.put_logs(logs[..2].to_vec()).unwrap();
        proc.put_logs(logs[2..].to_vec()).unwrap();

        let rows = proc.into_rows().unwrap();
        assert_eq!(
            rows,
            vec![
                vec![
                    Value::Str("log2".into()),
                    Value::StrArray(vec!["m2".into(), "m3".into()])
                ],
                vec![
                    Value::Str("log4".into()),
                    Value::StrArray(vec!["m4".into(), "m5".into()])
                ],
            ]
        );
    }

    #[test]
    fn grouped_query_aggregates_and_filters_groups() {
        let query = SearchQuery {
            storage: "storage".into(),
            select: vec!["traces".into(), "sum[level, level > ?0]".into()],
            aggreg_values: vec![json!(1)],
            group_by: "traces".into(),
            having: "count[] > ?0".into(),
            having_values: vec![json!(0)],
            order_by: "traces".into(),
            ..SearchQuery::default()
        };
        let (mut proc, plan) = Processor::new(query).unwrap();
        assert!(plan.columns.contains(Column::Traces));
        assert!(plan.columns.contains(Column::Level));

        let logs = sample_logs();
        proc.put_logs(logs[..2].to_vec()).unwrap();
        proc.put_logs(logs[2..].to_vec()).unwrap();

        let rows = proc.into_rows().unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::StrArray(vec!["trace1".into()]), Value::Int(0)],
                vec![Value::StrArray(vec!["trace2".into()]), Value::Int(5)],
            ]
        );
    }

    #[test]
    fn having_filters_groups_out() {
        let query = SearchQuery {
            storage: "storage".into(),
            select: vec!["traces".into(), "count[]".into()],
            group_by: "traces".into(),
            having: "max[level] >= ?0".into(),
            having_values: vec![json!(2)],
            ..SearchQuery::default()
        };
        let (mut proc, _) = Processor::new(query).unwrap();
        proc.put_logs(sample_logs()).unwrap();

        let rows = proc.into_rows().unwrap();
        assert_eq!(
            rows,
            vec![vec![Value::StrArray(vec!["trace2".into()]), Value::Int(2)]]
        );
    }

    #[test]
    fn timestamp_merge_pools_crossing_packs() {
        let query = SearchQuery {
            storage: "storage".into(),
            select: vec!["timestamp".into()],
            ..SearchQuery::default()
        };
        let (mut proc, _) = Processor::new(query).unwrap();

        let pack = |timestamps: &[i64]| -> Vec<LogRecord> {
            timestamps
                .iter()
                .map(|ts| LogRecord {
                    timestamp: *ts,
                    ..LogRecord::default()
                })
                .collect()
        };
        // Packs 1 and 2 cross; pack 3 stands alone.
        proc.put_logs(pack(&[1, 3, 5])).unwrap();
        proc.put_logs(pack(&[2, 4])).unwrap();
        proc.put_logs(pack(&[7, 8])).unwrap();

        let rows = proc.into_rows().unwrap();
        let timestamps: Vec<Value> = rows.into_iter().map(|mut r| r.remove(0)).collect();
        assert_eq!(
            timestamps,
            (1..=5)
                .chain(7..=8)
                .map(Value::Int)
                .collect::<Vec<Value>>()
        );
    }

    #[test]
    fn descending_order_reverses() {
        let query = SearchQuery {
            storage: "storage".into(),
            select: vec!["entity".into()],
            order_by: "-entity".into(),
            ..SearchQuery::default()
        };
        let (mut proc, _) = Processor::new(query).unwrap();
        proc.put_logs(sample_logs()).unwrap();

        let rows = proc.into_rows().unwrap();
        let entities: Vec<Value> = rows.into_iter().map(|mut r| r.remove(0)).collect();
        assert_eq!(
            entities,
            vec![
                Value::Str("log4".into()),
                Value::Str("log3".into()),
                Value::Str("log2".into()),
                Value::Str("log1".into()),
            ]
        );
    }

    #[test]
    fn offset_and_limit_slice_rows() {
        let query = SearchQuery {
            storage: "storage".into(),
            select: vec!["entity".into()],
            order_by: "entity".into(),
            offset: 1,
            limit: 2,
            ..SearchQuery::default()
        };
        let (mut proc, _) = Processor::new(query).unwrap();
        proc.put_logs(sample_logs()).unwrap();

        let rows = proc.into_rows().unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::Str("log2".into())],
                vec![Value::Str("log3".into())],
            ]
        );
    }

    #[test]
    fn select_passthrough_for_unknown_entries() {
        let query = SearchQuery {
            storage: "storage".into(),
            select: vec!["entity".into(), "literal".into()],
            ..SearchQuery::default()
        };
        let (mut proc, _) = Processor::new(query).unwrap();
        proc.put_logs(sample_logs()[..1].to_vec()).unwrap();

        let rows = proc.into_rows().unwrap();
        assert_eq!(
            rows,
            vec![vec![
                Value::Str("log1".into()),
                Value::Str("literal".into())
            ]]
        );
    }

    #[test]
    fn invalid_queries_are_rejected() {
        // No storage.
        assert!(Processor::new(SearchQuery::default()).is_err());

        // Plain column in select alongside grouping by another column.
        let query = SearchQuery {
            storage: "s".into(),
            select: vec!["entity".into()],
            group_by: "traces".into(),
            ..SearchQuery::default()
        };
        assert!(Processor::new(query).is_err());

        // Grouping by the map column.
        let query = SearchQuery {
            storage: "s".into(),
            group_by: "fields".into(),
            ..SearchQuery::default()
        };
        assert!(Processor::new(query).is_err());

        // Ordering by something that is neither column nor aggregator.
        let query = SearchQuery {
            storage: "s".into(),
            order_by: "nope".into(),
            ..SearchQuery::default()
        };
        assert!(Processor::new(query).is_err());

        // Ordering by an unregistered aggregator in grouped mode.
        let query = SearchQuery {
            storage: "s".into(),
            select: vec!["traces".into()],
            group_by: "traces".into(),
            order_by: "sum[level]".into(),
            ..SearchQuery::default()
        };
        assert!(Processor::new(query).is_err());
    }
}
