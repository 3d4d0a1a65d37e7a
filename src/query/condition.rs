//! The condition grammar and its evaluation tree.
//!
//! ```text
//! expr    := term (('&'|'|') term)*
//! term    := '!' term | '(' expr ')' | atom
//! atom    := operand OP operand
//! OP      := '=='|'!='|'>'|'>='|'<'|'<='|'=>'
//! operand := '?' N | column | aggr_expr
//! ```
//!
//! `?N` interpolates a caller-provided value by index, `=>` is membership.
//! Inversion is a lazy bit on each node rather than a DeMorgan rewrite, and
//! `&`/`|` evaluation short-circuits.

use crate::model::{Column, LoadPlan, Value, ValueSource, ValueType};
use crate::query::aggregate::{self, Aggregator};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Comparison operators. `In` is the `=>` membership test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

/// One side of a comparison: either a literal value or a key resolved
/// against the evaluation source at check time.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    ty: ValueType,
    value: Option<Value>,
    source_key: Option<String>,
}

impl Operand {
    fn literal(value: Value) -> Operand {
        Operand {
            ty: value.value_type(),
            value: Some(value),
            source_key: None,
        }
    }

    fn keyed(key: &str, ty: ValueType) -> Operand {
        Operand {
            ty,
            value: None,
            source_key: Some(key.to_string()),
        }
    }

    fn resolve(&self, source: &dyn ValueSource) -> Result<Value> {
        if let Some(key) = &self.source_key {
            return source
                .lookup(key)
                .ok_or_else(|| Error::Internal(format!("condition source not found: {key}")));
        }
        self.value
            .clone()
            .ok_or_else(|| Error::Internal("operand has no value".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        left: Operand,
        op: CmpOp,
        right: Operand,
        invert: bool,
    },
    Branch {
        op: BoolOp,
        first: Box<Condition>,
        second: Box<Condition>,
        invert: bool,
    },
}

impl Condition {
    pub fn check(&self, source: &dyn ValueSource) -> Result<bool> {
        match self {
            Condition::Compare {
                left,
                op,
                right,
                invert,
            } => {
                let lhs = left.resolve(source)?;
                let rhs = right.resolve(source)?;
                Ok(compare(*op, &lhs, &rhs)? != *invert)
            }
            Condition::Branch {
                op,
                first,
                second,
                invert,
            } => {
                let mut result = first.check(source)?;
                // Short-circuit: OR stops on the first true, AND on the first false.
                if result != matches!(op, BoolOp::Or) {
                    result = second.check(source)?;
                }
                Ok(result != *invert)
            }
        }
    }

    pub fn invert(&mut self) {
        match self {
            Condition::Compare { invert, .. } | Condition::Branch { invert, .. } => {
                *invert = !*invert
            }
        }
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool> {
    let int_pair = || -> Result<(i64, i64)> {
        match (lhs.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(Error::Internal("ordering operator on non-integers".to_string())),
        }
    };

    match op {
        CmpOp::Eq => Ok(lhs == rhs),
        CmpOp::Ne => Ok(lhs != rhs),
        CmpOp::Gt => int_pair().map(|(a, b)| a > b),
        CmpOp::Ge => int_pair().map(|(a, b)| a >= b),
        CmpOp::Lt => int_pair().map(|(a, b)| a < b),
        CmpOp::Le => int_pair().map(|(a, b)| a <= b),
        CmpOp::In => match (lhs, rhs) {
            (Value::Str(v), Value::StrArray(arr)) => Ok(arr.contains(v)),
            (Value::Int(v), Value::IntArray(arr)) => Ok(arr.contains(v)),
            _ => Err(Error::Internal("membership operator on mismatched types".to_string())),
        },
    }
}

/// Aggregator registration hooks for parsing `having` conditions: operands
/// may name the grouping column or an aggregator expression, which is parsed
/// on first sight and registered for the group engine.
pub struct HavingContext<'a> {
    pub group_by: Column,
    pub aggregators: &'a mut BTreeMap<String, Aggregator>,
    pub aggreg_values: &'a [serde_json::Value],
}

struct ParseCtx<'a, 'b> {
    values: &'a [serde_json::Value],
    having: Option<&'a mut HavingContext<'b>>,
    plan: Option<&'a mut LoadPlan>,
}

/// Parse a condition expression. `having` switches operand resolution to
/// aggregator mode; `plan` collects the columns the condition touches.
pub fn parse(
    source: &str,
    values: &[serde_json::Value],
    having: Option<&mut HavingContext<'_>>,
    plan: Option<&mut LoadPlan>,
) -> Result<Condition> {
    let mut ctx = ParseCtx {
        values,
        having,
        plan,
    };
    let mut pos = 0;
    parse_expr(source, &mut pos, &mut ctx)
}

fn attach(pending: Option<(BoolOp, Condition)>, second: Condition) -> Condition {
    match pending {
        None => second,
        Some((op, first)) => Condition::Branch {
            op,
            first: Box::new(first),
            second: Box::new(second),
            invert: false,
        },
    }
}

fn parse_expr(source: &str, pos: &mut usize, ctx: &mut ParseCtx) -> Result<Condition> {
    let bytes = source.as_bytes();
    let is_root = *pos == 0;
    let mut start = *pos;
    let mut current: Option<Condition> = None;
    let mut pending: Option<(BoolOp, Condition)> = None;

    while *pos < bytes.len() {
        match bytes[*pos] {
            b'(' | b'!' => {
                let invert = bytes[*pos] == b'!';
                if invert {
                    if *pos + 1 == bytes.len() {
                        return Err(Error::bad_request("'!' at end of condition"));
                    }
                    // '!' not followed by a group is either '!=' or a negated
                    // atom; both are resolved when the atom text is parsed.
                    if bytes[*pos + 1] != b'(' {
                        *pos += 1;
                        continue;
                    }
                    *pos += 2;
                } else {
                    *pos += 1;
                }
                let mut group = parse_expr(source, pos, ctx)?;
                if invert {
                    group.invert();
                }
                current = Some(group);
                *pos += 1; // step over the closing bracket
            }
            b')' => {
                if is_root {
                    return Err(Error::bad_request("Extra bracket ')'"));
                }
                break;
            }
            op @ (b'&' | b'|') => {
                let cond = match current.take() {
                    Some(cond) => cond,
                    None => parse_atom(source[start..*pos].trim(), ctx)?,
                };
                start = *pos + 1;

                let first = attach(pending.take(), cond);
                let bool_op = if op == b'|' { BoolOp::Or } else { BoolOp::And };
                pending = Some((bool_op, first));
                *pos += 1;
            }
            _ => *pos += 1,
        }
    }

    if !is_root && *pos == bytes.len() {
        return Err(Error::bad_request("Extra bracket '('"));
    }
    if start == bytes.len() {
        return Err(Error::bad_request("Expected condition after operator"));
    }

    let cond = match current.take() {
        Some(cond) => cond,
        None => parse_atom(source[start..*pos].trim(), ctx)?,
    };
    Ok(attach(pending.take(), cond))
}

fn parse_atom(source: &str, ctx: &mut ParseCtx) -> Result<Condition> {
    // Negated atom: '!' before anything but '='.
    if let Some(rest) = source.strip_prefix('!') {
        if !rest.starts_with('=') {
            let mut cond = parse_atom(rest.trim_start(), ctx)?;
            cond.invert();
            return Ok(cond);
        }
    }

    let (left_s, right_s, op) = split_comparison(source)?;
    let left = parse_operand(left_s, ctx)?;
    let right = parse_operand(right_s, ctx)?;

    if op == CmpOp::In {
        let compatible = (left.ty == ValueType::Str && right.ty == ValueType::StrArray)
            || (left.ty == ValueType::Int && right.ty == ValueType::IntArray);
        if !compatible {
            return Err(Error::bad_request(format!(
                "Incompatible operand types: {source}"
            )));
        }
    } else {
        if left.ty != right.ty {
            return Err(Error::bad_request(format!(
                "Different operand types: {source}"
            )));
        }
        if left.ty == ValueType::StrMap {
            return Err(Error::bad_request(format!(
                "Invalid operand type: {source}"
            )));
        }
        let ordering = matches!(op, CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le);
        if ordering && left.ty != ValueType::Int {
            return Err(Error::bad_request(format!(
                "Incorrect operand type for ordering operator: {source}"
            )));
        }
    }

    Ok(Condition::Compare {
        left,
        op,
        right,
        invert: false,
    })
}

fn split_comparison(source: &str) -> Result<(&str, &str, CmpOp)> {
    const OPS: [(&[u8], CmpOp); 7] = [
        (b"==", CmpOp::Eq),
        (b">=", CmpOp::Ge),
        (b">", CmpOp::Gt),
        (b"!=", CmpOp::Ne),
        (b"<=", CmpOp::Le),
        (b"<", CmpOp::Lt),
        (b"=>", CmpOp::In),
    ];

    let bytes = source.as_bytes();
    let at = bytes
        .iter()
        .position(|b| matches!(b, b'>' | b'<' | b'=' | b'!'))
        .unwrap_or(bytes.len());
    if at + 2 > bytes.len() {
        return Err(Error::bad_request(format!("Incorrect condition: {source}")));
    }

    let sub = &bytes[at..at + 2];
    let Some((op, end)) = OPS
        .iter()
        .find_map(|(pat, op)| sub.starts_with(pat).then_some((*op, at + pat.len())))
    else {
        return Err(Error::bad_request(format!("Expected operator: {source}")));
    };

    let left = source[..at].trim();
    let right = source[end..].trim();
    if left.is_empty() || right.is_empty() {
        return Err(Error::bad_request(format!("Expected operand: {source}")));
    }
    Ok((left, right, op))
}

fn parse_operand(source: &str, ctx: &mut ParseCtx) -> Result<Operand> {
    if source.len() < 2 {
        return Err(Error::bad_request(format!("Incorrect operand: {source}")));
    }

    if let Some(index_s) = source.strip_prefix('?') {
        let value = index_s
            .parse::<usize>()
            .ok()
            .and_then(|index| ctx.values.get(index))
            .ok_or_else(|| Error::bad_request(format!("Incorrect index: {source}")))?;
        return operand_from_json(value, source);
    }

    match ctx.having.as_deref_mut() {
        None => {
            if let Some(column) = Column::parse(source) {
                if let Some(plan) = ctx.plan.as_deref_mut() {
                    plan.columns.insert(column);
                }
                return Ok(Operand::keyed(source, column.value_type()));
            }
        }
        Some(having) => {
            if source == having.group_by.name() {
                if let Some(plan) = ctx.plan.as_deref_mut() {
                    plan.columns.insert(having.group_by);
                }
                return Ok(Operand::keyed(source, having.group_by.value_type()));
            }
            if let Some(open) = source.find('[') {
                if source.ends_with(']') {
                    if !aggregate::is_known_aggregator(&source[..open]) {
                        return Err(Error::bad_request(format!(
                            "Incorrect aggregator: {source}"
                        )));
                    }
                    if !having.aggregators.contains_key(source) {
                        let aggr = aggregate::parse(
                            source,
                            having.aggreg_values,
                            ctx.plan.as_deref_mut(),
                        )?;
                        having.aggregators.insert(source.to_string(), aggr);
                    }
                    return Ok(Operand::keyed(source, ValueType::Int));
                }
            }
        }
    }

    Err(Error::bad_request(format!("Incorrect operand: {source}")))
}

fn operand_from_json(value: &serde_json::Value, source: &str) -> Result<Operand> {
    match value {
        serde_json::Value::String(s) => Ok(Operand::literal(Value::Str(s.clone()))),
        serde_json::Value::Number(n) => {
            let int = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| Error::bad_request(format!("Invalid operand type: {source}")))?;
            Ok(Operand::literal(Value::Int(int)))
        }
        serde_json::Value::Array(items) => array_operand(items, source),
        _ => Err(Error::bad_request(format!("Invalid operand type: {source}"))),
    }
}

fn array_operand(items: &[serde_json::Value], source: &str) -> Result<Operand> {
    let Some(first) = items.first() else {
        return Err(Error::bad_request(format!("Array is empty: {source}")));
    };

    if first.is_string() {
        let strings: Option<Vec<String>> = items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect();
        return strings
            .map(|arr| Operand::literal(Value::StrArray(arr)))
            .ok_or_else(|| Error::bad_request(format!("Incorrect item type in array: {source}")));
    }
    if first.is_number() {
        let ints: Option<Vec<i64>> = items
            .iter()
            .map(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .collect();
        return ints
            .map(|arr| Operand::literal(Value::IntArray(arr)))
            .ok_or_else(|| Error::bad_request(format!("Incorrect item type in array: {source}")));
    }
    Err(Error::bad_request(format!("Invalid array item type: {source}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogRecord;
    use serde_json::json;

    fn parse_plain(s: &str, values: &[serde_json::Value]) -> Result<Condition> {
        parse(s, values, None, None)
    }

    fn log(level: u8, entity: &str, modules: &[&str]) -> LogRecord {
        LogRecord {
            timestamp: 1,
            level,
            entity: entity.into(),
            modules: modules.iter().map(|m| m.to_string()).collect(),
            ..LogRecord::default()
        }
    }

    #[test]
    fn split_finds_each_operator() {
        let cases: &[(&str, CmpOp)] = &[
            (" A ==  B ", CmpOp::Eq),
            (" A!=  B", CmpOp::Ne),
            ("A <= B", CmpOp::Le),
            ("A < B ", CmpOp::Lt),
            (" A>=B  ", CmpOp::Ge),
            ("A  >B  ", CmpOp::Gt),
            ("A=>B", CmpOp::In),
        ];
        for (source, expected) in cases {
            let (left, right, op) = split_comparison(source).unwrap();
            assert_eq!(left, "A", "{source}");
            assert_eq!(right, "B", "{source}");
            assert_eq!(op, *expected, "{source}");
        }

        assert!(split_comparison(" A  =    B  ").is_err());
        assert!(split_comparison("  ==    B  ").is_err());
        assert!(split_comparison(">").is_err());
        assert!(split_comparison("").is_err());
    }

    #[test]
    fn operand_interpolation() {
        let values = vec![json!("abc"), json!(5.0), json!(["ab", "cd"]), json!([2, 5])];
        let mut ctx = ParseCtx {
            values: &values,
            having: None,
            plan: None,
        };

        assert_eq!(
            parse_operand("?0", &mut ctx).unwrap(),
            Operand::literal(Value::Str("abc".into()))
        );
        assert_eq!(
            parse_operand("?1", &mut ctx).unwrap(),
            Operand::literal(Value::Int(5))
        );
        assert_eq!(
            parse_operand("?2", &mut ctx).unwrap(),
            Operand::literal(Value::StrArray(vec!["ab".into(), "cd".into()]))
        );
        assert_eq!(
            parse_operand("?3", &mut ctx).unwrap(),
            Operand::literal(Value::IntArray(vec![2, 5]))
        );
        assert_eq!(
            parse_operand("level", &mut ctx).unwrap(),
            Operand::keyed("level", ValueType::Int)
        );

        assert!(parse_operand("?9", &mut ctx).is_err());
        assert!(parse_operand("?", &mut ctx).is_err());
        assert!(parse_operand("?abc", &mut ctx).is_err());
        assert!(parse_operand("no_such_column", &mut ctx).is_err());
    }

    #[test]
    fn mixed_arrays_are_rejected() {
        let values = vec![json!([1.0, 2.0, "a"])];
        let mut ctx = ParseCtx {
            values: &values,
            having: None,
            plan: None,
        };
        assert!(parse_operand("?0", &mut ctx).is_err());
    }

    #[test]
    fn type_rules() {
        assert!(parse_plain("level > ?0", &[json!(2)]).is_ok());
        assert!(parse_plain("?1 => modules", &[json!(2), json!("abc")]).is_ok());
        // Membership requires (scalar, array) of the same element type.
        assert!(parse_plain("?1 => level", &[json!(2), json!("abc")]).is_err());
        // Mismatched scalar types.
        assert!(parse_plain("?0 >= ?1", &[json!(5), json!("ab")]).is_err());
        // Ordering on strings.
        assert!(parse_plain("?0 >= ?1", &[json!("ab"), json!("cd")]).is_err());
        // Maps never participate.
        assert!(parse_plain("fields == fields", &[]).is_err());
    }

    #[test]
    fn grammar_accepts_nesting_and_negation() {
        let values = vec![json!(1), json!("e"), json!(3)];
        let cond = parse_plain("level >= ?0 & (entity == ?1 | !level == ?2)", &values).unwrap();

        assert!(cond.check(&log(1, "e", &[])).unwrap());
        assert!(cond.check(&log(1, "other", &[])).unwrap());
        assert!(!cond.check(&log(3, "other", &[])).unwrap());
        assert!(!cond.check(&log(0, "e", &[])).unwrap());
    }

    #[test]
    fn grammar_rejects_malformed_input() {
        assert!(parse_plain("(level == ?0", &[json!(1)]).is_err());
        assert!(parse_plain("level == ?0)", &[json!(1)]).is_err());
        assert!(parse_plain("level == ?0 & ", &[json!(1)]).is_err());
        assert!(parse_plain("level == ?0 !", &[json!(1)]).is_err());
        assert!(parse_plain("level = ?0", &[json!(1)]).is_err());
        assert!(parse_plain("", &[]).is_err());
    }

    #[test]
    fn group_inversion_applies_de_morgan_free() {
        let values = vec![json!(1), json!(2)];
        let cond = parse_plain("!(level == ?0 | level == ?1)", &values).unwrap();
        assert!(!cond.check(&log(1, "e", &[])).unwrap());
        assert!(!cond.check(&log(2, "e", &[])).unwrap());
        assert!(cond.check(&log(3, "e", &[])).unwrap());
    }

    #[test]
    fn short_circuit_skips_poisoned_branch() {
        // The right side would fail on lookup, but the left side decides.
        let cond = parse_plain("?0 == ?1 | ?0 == ?1", &[json!(1), json!(1)]).unwrap();
        assert!(cond.check(&log(0, "e", &[])).unwrap());
    }

    #[test]
    fn membership_checks_arrays() {
        let cond = parse_plain("?0 => modules", &[json!("net")]).unwrap();
        assert!(cond.check(&log(0, "e", &["net", "io"])).unwrap());
        assert!(!cond.check(&log(0, "e", &["io"])).unwrap());
    }

    #[test]
    fn condition_collects_columns_into_plan() {
        let mut plan = LoadPlan::default();
        parse(
            "level == ?0 & entity != ?1",
            &[json!(1), json!("e")],
            None,
            Some(&mut plan),
        )
        .unwrap();
        assert!(plan.columns.contains(Column::Level));
        assert!(plan.columns.contains(Column::Entity));
        assert!(!plan.columns.contains(Column::Message));
    }
}
