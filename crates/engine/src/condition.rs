//! Rule/workflow condition evaluation.
//!
//! A condition compares one top-level field of the event body against a
//! target value. The target is coerced to the *observed* value's type; any
//! coercion failure — or a missing field — makes the condition false, never
//! an error.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: JsonValue,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: JsonValue) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Evaluate against an event body.
    pub fn evaluate(&self, body: &JsonValue) -> bool {
        let Some(observed) = body.as_object().and_then(|obj| obj.get(&self.field)) else {
            return false;
        };
        match observed {
            JsonValue::Number(n) => {
                let Some(observed) = n.as_f64() else {
                    return false;
                };
                let Some(target) = coerce_number(&self.value) else {
                    return false;
                };
                compare_f64(self.operator, observed, target)
            }
            JsonValue::Bool(observed) => {
                let Some(target) = coerce_bool(&self.value) else {
                    return false;
                };
                match self.operator {
                    Operator::Eq => *observed == target,
                    Operator::Ne => *observed != target,
                    // Ordering booleans is a configuration mistake.
                    _ => false,
                }
            }
            JsonValue::String(observed) => {
                let target = coerce_string(&self.value);
                compare_ord(self.operator, observed.as_str(), target.as_str())
            }
            // Arrays/objects/null have no comparison semantics.
            _ => false,
        }
    }
}

fn coerce_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn coerce_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        JsonValue::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

fn coerce_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare_f64(op: Operator, left: f64, right: f64) -> bool {
    match op {
        Operator::Eq => left == right,
        Operator::Ne => left != right,
        Operator::Gt => left > right,
        Operator::Lt => left < right,
        Operator::Ge => left >= right,
        Operator::Le => left <= right,
    }
}

fn compare_ord<T: Ord + ?Sized>(op: Operator, left: &T, right: &T) -> bool {
    match op {
        Operator::Eq => left == right,
        Operator::Ne => left != right,
        Operator::Gt => left > right,
        Operator::Lt => left < right,
        Operator::Ge => left >= right,
        Operator::Le => left <= right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparison() {
        let condition = Condition::new("quantity_remaining", Operator::Lt, json!(10));
        assert!(condition.evaluate(&json!({"quantity_remaining": 7})));
        assert!(!condition.evaluate(&json!({"quantity_remaining": 15})));
        assert!(!condition.evaluate(&json!({"quantity_remaining": 10})));
    }

    #[test]
    fn missing_field_is_false() {
        let condition = Condition::new("quantity_remaining", Operator::Lt, json!(10));
        assert!(!condition.evaluate(&json!({"product_id": "P"})));
        assert!(!condition.evaluate(&json!(null)));
    }

    #[test]
    fn target_coerced_to_observed_type() {
        // Observed is a number, target is a numeric string.
        let condition = Condition::new("amount", Operator::Gt, json!("1000"));
        assert!(condition.evaluate(&json!({"amount": 2000})));

        // Observed is a string, target compared lexically.
        let condition = Condition::new("status", Operator::Eq, json!("PASSED"));
        assert!(condition.evaluate(&json!({"status": "PASSED"})));
        assert!(!condition.evaluate(&json!({"status": "REJECTED"})));
    }

    #[test]
    fn coercion_failure_is_false() {
        let condition = Condition::new("amount", Operator::Gt, json!("not-a-number"));
        assert!(!condition.evaluate(&json!({"amount": 2000})));
    }

    #[test]
    fn boolean_equality_only() {
        let eq = Condition::new("approved", Operator::Eq, json!(true));
        assert!(eq.evaluate(&json!({"approved": true})));
        assert!(eq.evaluate(&json!({"approved": true, "extra": 1})));

        let gt = Condition::new("approved", Operator::Gt, json!(false));
        assert!(!gt.evaluate(&json!({"approved": true})));
    }

    #[test]
    fn operators_serialize_as_symbols() {
        assert_eq!(serde_json::to_string(&Operator::Ge).unwrap(), r#"">=""#);
        let parsed: Operator = serde_json::from_str(r#""!=""#).unwrap();
        assert_eq!(parsed, Operator::Ne);
    }
}
