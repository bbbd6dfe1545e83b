//! Step expansion: turns iteration constructs into concrete sub-steps.
//!
//! A step template may bind any parameter (at any depth) to an iteration
//! construct:
//!
//! ```yaml
//! port: { each: [80, 443] }
//! delay: { range: { from: 1, to: 3 } }
//! ```
//!
//! The template expands to one sub-step per combination of construct values
//! (cartesian product, first construct in key order varying slowest). The
//! expanded sub-steps take the template's place inside its step group.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::module::{Payload, StepGroup, StepParams};

const EACH_KEY: &str = "each";
const RANGE_KEY: &str = "range";

/// Upper bound on the sub-steps one template may expand to
pub const MAX_SUB_STEPS: usize = 100_000;

/// Errors raised by malformed iteration constructs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpandError {
    /// `each` must hold a sequence
    #[error("'each' at '{path}' must be a sequence")]
    EachNotSequence { path: String },

    /// `range` is missing bounds, has non-integer bounds or a zero step
    #[error("invalid range at '{path}': {reason}")]
    InvalidRange { path: String, reason: String },

    /// The template would expand past [`MAX_SUB_STEPS`]
    #[error("'{path}' expands to more than {limit} sub-steps")]
    TooManyCombinations { path: String, limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSeg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParamPath(Vec<PathSeg>);

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                PathSeg::Key(k) if i == 0 => write!(f, "{}", k)?,
                PathSeg::Key(k) => write!(f, ".{}", k)?,
                PathSeg::Index(n) => write!(f, "[{}]", n)?,
            }
        }
        Ok(())
    }
}

/// A parameter bound to multiple values
#[derive(Debug)]
struct Construct {
    path: ParamPath,
    values: Vec<Value>,
}

/// Expand every payload's step groups. Payload order, group order and
/// library assignment are preserved.
pub fn expand(payloads: Vec<Payload>) -> Result<Vec<Payload>, ExpandError> {
    payloads
        .into_iter()
        .map(|mut payload| -> Result<Payload, ExpandError> {
            payload.steps = payload
                .steps
                .into_iter()
                .map(expand_group)
                .collect::<Result<_, _>>()?;
            Ok(payload)
        })
        .collect()
}

fn expand_group(group: StepGroup) -> Result<StepGroup, ExpandError> {
    let mut sub_steps = Vec::with_capacity(group.len());
    for template in group.into_inner() {
        sub_steps.extend(expand_step(&template)?);
    }
    Ok(StepGroup::new(sub_steps))
}

/// Expand a single step template into its concrete sub-steps.
pub fn expand_step(template: &StepParams) -> Result<Vec<StepParams>, ExpandError> {
    let mut constructs = Vec::new();
    for (key, value) in template {
        collect(value, &mut vec![PathSeg::Key(key.clone())], &mut constructs)?;
    }

    if constructs.is_empty() {
        return Ok(vec![template.clone()]);
    }

    let total = constructs
        .iter()
        .try_fold(1usize, |acc, c| acc.checked_mul(c.values.len()))
        .filter(|total| *total <= MAX_SUB_STEPS)
        .ok_or_else(|| ExpandError::TooManyCombinations {
            path: constructs
                .iter()
                .map(|c| c.path.to_string())
                .collect::<Vec<_>>()
                .join(" x "),
            limit: MAX_SUB_STEPS,
        })?;
    let mut expanded = Vec::with_capacity(total);
    let mut cursor = vec![0usize; constructs.len()];

    for _ in 0..total {
        let mut step = template.clone();
        for (construct, &pick) in constructs.iter().zip(&cursor) {
            set_at(&mut step, &construct.path, construct.values[pick].clone());
        }
        expanded.push(step);

        // Odometer: the last construct varies fastest
        for slot in (0..cursor.len()).rev() {
            cursor[slot] += 1;
            if cursor[slot] < constructs[slot].values.len() {
                break;
            }
            cursor[slot] = 0;
        }
    }

    Ok(expanded)
}

fn collect(
    value: &Value,
    path: &mut Vec<PathSeg>,
    out: &mut Vec<Construct>,
) -> Result<(), ExpandError> {
    if let Some(values) = construct_values(value, path)? {
        out.push(Construct {
            path: ParamPath(path.clone()),
            values,
        });
        return Ok(());
    }

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                path.push(PathSeg::Key(key.clone()));
                collect(child, path, out)?;
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                path.push(PathSeg::Index(index));
                collect(child, path, out)?;
                path.pop();
            }
        }
        _ => {}
    }
    Ok(())
}

/// Values of an iteration construct, or `None` if `value` is not one.
fn construct_values(value: &Value, path: &[PathSeg]) -> Result<Option<Vec<Value>>, ExpandError> {
    let Value::Object(map) = value else {
        return Ok(None);
    };
    if map.len() != 1 {
        return Ok(None);
    }

    let display = || ParamPath(path.to_vec()).to_string();

    if let Some(each) = map.get(EACH_KEY) {
        return match each {
            Value::Array(items) => Ok(Some(items.clone())),
            _ => Err(ExpandError::EachNotSequence { path: display() }),
        };
    }

    if let Some(range) = map.get(RANGE_KEY) {
        return range_values(range, display).map(Some);
    }

    Ok(None)
}

fn range_values(range: &Value, path: impl Fn() -> String) -> Result<Vec<Value>, ExpandError> {
    let invalid = |reason: String| ExpandError::InvalidRange {
        path: path(),
        reason,
    };
    let bound = |name: &str| -> Result<Option<i64>, ExpandError> {
        match range.get(name) {
            None => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| invalid(format!("'{}' must be an integer", name))),
        }
    };

    let from = bound("from")?.ok_or_else(|| invalid("missing 'from'".to_string()))?;
    let to = bound("to")?.ok_or_else(|| invalid("missing 'to'".to_string()))?;
    let step = bound("step")?.unwrap_or(1);

    if step == 0 {
        return Err(invalid("'step' must not be zero".to_string()));
    }

    // Wide arithmetic so the length of i64::MIN..=i64::MAX still fits
    let span = i128::from(to) - i128::from(from);
    let len = if span == 0 || (span > 0) == (step > 0) {
        span / i128::from(step) + 1
    } else {
        0
    };
    if len > MAX_SUB_STEPS as i128 {
        return Err(ExpandError::TooManyCombinations {
            path: path(),
            limit: MAX_SUB_STEPS,
        });
    }

    let mut values = Vec::with_capacity(len as usize);
    let mut current = from;
    while (step > 0 && current <= to) || (step < 0 && current >= to) {
        values.push(Value::from(current));
        match current.checked_add(step) {
            Some(next) => current = next,
            None => break,
        }
    }
    Ok(values)
}

fn set_at(step: &mut StepParams, path: &ParamPath, value: Value) {
    let Some((PathSeg::Key(first), rest)) = path.0.split_first() else {
        return;
    };
    let Some(mut slot) = step.get_mut(first) else {
        return;
    };

    for seg in rest {
        let next = match (seg, slot) {
            (PathSeg::Key(k), Value::Object(map)) => map.get_mut(k),
            (PathSeg::Index(i), Value::Array(items)) => items.get_mut(*i),
            _ => None,
        };
        match next {
            Some(v) => slot = v,
            None => return,
        }
    }
    *slot = value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> StepParams {
        match value {
            Value::Object(map) => map,
            _ => panic!("test params must be an object"),
        }
    }

    #[test]
    fn test_template_without_constructs_is_kept() {
        let template = params(json!({"target": "10.0.0.5", "ports": [80, 443]}));
        let out = expand_step(&template).unwrap();
        assert_eq!(out, vec![template]);
    }

    #[test]
    fn test_each_expands_in_order() {
        let template = params(json!({"target": "h", "port": {"each": [80, 443]}}));
        let out = expand_step(&template).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["port"], json!(80));
        assert_eq!(out[1]["port"], json!(443));
        assert_eq!(out[1]["target"], json!("h"));
    }

    #[test]
    fn test_cartesian_product_first_varies_slowest() {
        let template = params(json!({
            "method": {"each": ["GET", "POST"]},
            "port": {"each": [80, 443, 8080]}
        }));
        let out = expand_step(&template).unwrap();
        assert_eq!(out.len(), 6);
        let pairs: Vec<(Value, Value)> = out
            .iter()
            .map(|s| (s["method"].clone(), s["port"].clone()))
            .collect();
        assert_eq!(pairs[0], (json!("GET"), json!(80)));
        assert_eq!(pairs[2], (json!("GET"), json!(8080)));
        assert_eq!(pairs[3], (json!("POST"), json!(80)));
    }

    #[test]
    fn test_nested_construct() {
        let template = params(json!({
            "request": {"headers": {"User-Agent": {"each": ["a", "b"]}}, "path": "/"}
        }));
        let out = expand_step(&template).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["request"]["headers"]["User-Agent"], json!("b"));
        assert_eq!(out[1]["request"]["path"], json!("/"));
    }

    #[test]
    fn test_construct_inside_array() {
        let template = params(json!({"pair": [1, {"each": [2, 3]}]}));
        let out = expand_step(&template).unwrap();
        assert_eq!(out[0]["pair"], json!([1, 2]));
        assert_eq!(out[1]["pair"], json!([1, 3]));
    }

    #[test]
    fn test_range_inclusive_with_step() {
        let template = params(json!({"n": {"range": {"from": 1, "to": 7, "step": 3}}}));
        let out = expand_step(&template).unwrap();
        let ns: Vec<Value> = out.iter().map(|s| s["n"].clone()).collect();
        assert_eq!(ns, vec![json!(1), json!(4), json!(7)]);
    }

    #[test]
    fn test_descending_range() {
        let template = params(json!({"n": {"range": {"from": 3, "to": 1, "step": -1}}}));
        assert_eq!(expand_step(&template).unwrap().len(), 3);
    }

    #[test]
    fn test_range_zero_step_rejected() {
        let template = params(json!({"n": {"range": {"from": 1, "to": 3, "step": 0}}}));
        assert!(matches!(
            expand_step(&template),
            Err(ExpandError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_range_longer_than_limit_rejected() {
        let template = params(json!({"n": {"range": {"from": 0, "to": i64::MAX}}}));
        assert_eq!(
            expand_step(&template).unwrap_err(),
            ExpandError::TooManyCombinations {
                path: "n".to_string(),
                limit: MAX_SUB_STEPS,
            }
        );
    }

    #[test]
    fn test_range_at_limit_accepted() {
        let to = MAX_SUB_STEPS as i64;
        let template = params(json!({"n": {"range": {"from": 1, "to": to}}}));
        assert_eq!(expand_step(&template).unwrap().len(), MAX_SUB_STEPS);
    }

    #[test]
    fn test_combination_overflow_rejected() {
        let wide = json!({"range": {"from": 1, "to": 65536}});
        let template = params(json!({
            "a": wide.clone(),
            "b": wide.clone(),
            "c": wide.clone(),
            "d": wide
        }));
        match expand_step(&template) {
            Err(ExpandError::TooManyCombinations { path, limit }) => {
                assert_eq!(path, "a x b x c x d");
                assert_eq!(limit, MAX_SUB_STEPS);
            }
            other => panic!("expected TooManyCombinations, got {:?}", other),
        }
    }

    #[test]
    fn test_combination_product_over_limit_rejected() {
        let template = params(json!({
            "a": {"range": {"from": 1, "to": 1000}},
            "b": {"range": {"from": 1, "to": 1000}}
        }));
        assert!(matches!(
            expand_step(&template),
            Err(ExpandError::TooManyCombinations { .. })
        ));
    }

    #[test]
    fn test_each_must_be_sequence() {
        let template = params(json!({"a": {"b": {"each": "x"}}}));
        let err = expand_step(&template).unwrap_err();
        assert_eq!(
            err,
            ExpandError::EachNotSequence {
                path: "a.b".to_string()
            }
        );
    }

    #[test]
    fn test_empty_each_yields_no_sub_steps() {
        let template = params(json!({"port": {"each": []}}));
        assert!(expand_step(&template).unwrap().is_empty());
    }

    #[test]
    fn test_object_with_extra_keys_is_not_a_construct() {
        let template = params(json!({"x": {"each": [1, 2], "other": true}}));
        assert_eq!(expand_step(&template).unwrap().len(), 1);
    }

    #[test]
    fn test_expand_preserves_payload_structure() {
        let payload = Payload {
            library: "http_scan".to_string(),
            steps: vec![
                StepGroup::new(vec![params(json!({"port": {"each": [1, 2]}}))]),
                StepGroup::new(vec![params(json!({"id": "c"}))]),
            ],
            extra: Default::default(),
        };
        let out = expand(vec![payload]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].library, "http_scan");
        assert_eq!(out[0].steps.len(), 2);
        assert_eq!(out[0].steps[0].len(), 2);
        assert_eq!(out[0].steps[1].len(), 1);
    }
}
