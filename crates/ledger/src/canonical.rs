//! Canonical JSON: the unique byte representation hashed into the chain.
//!
//! Rules: object keys sorted lexicographically (byte order), UTF-8, no
//! insignificant whitespace, integers without fraction. Two values with the
//! same content always produce byte-identical output.

use serde_json::Value as JsonValue;

/// Serialize a JSON value canonically.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &JsonValue) {
    match value {
        JsonValue::Object(map) => {
            // serde_json's default Map is a BTreeMap, but sort explicitly so
            // canonical bytes do not depend on the preserve_order feature.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, &JsonValue::String((*key).clone()));
                out.push(':');
                write_value(out, &map[*key]);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        // serde_json renders strings, numbers, bools and null compactly and
        // deterministically (integers carry no fraction).
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted() {
        let value = json!({"zeta": 1, "alpha": 2, "mid": {"b": 1, "a": 2}});
        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":2,"mid":{"a":2,"b":1},"zeta":1}"#
        );
    }

    #[test]
    fn no_insignificant_whitespace() {
        let value = json!({"a": [1, 2, 3], "b": "x y"});
        assert_eq!(canonical_json(&value), r#"{"a":[1,2,3],"b":"x y"}"#);
    }

    #[test]
    fn integers_carry_no_fraction() {
        let value = json!({"n": 200, "s": "200.00"});
        assert_eq!(canonical_json(&value), r#"{"n":200,"s":"200.00"}"#);
    }

    proptest! {
        /// Canonical JSON is a function of the value: identical content gives
        /// byte-identical output regardless of construction order.
        #[test]
        fn deterministic_under_key_order(
            a in "[a-m]{1,6}",
            b in "[n-z]{1,6}",
            x in any::<i64>(),
            y in "[ -~]{0,12}",
        ) {
            prop_assume!(a != b);
            let forward = json!({(a.clone()): x, (b.clone()): y});
            let mut reversed = serde_json::Map::new();
            reversed.insert(b.clone(), json!(y));
            reversed.insert(a.clone(), json!(x));
            prop_assert_eq!(
                canonical_json(&forward),
                canonical_json(&JsonValue::Object(reversed))
            );
        }
    }
}
