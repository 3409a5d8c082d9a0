// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structural validation of incoming batch envelopes.
//!
//! [`parse_envelope`] walks a raw JSON value in a fixed check order and
//! reports the *first* failure with a reason that names the offending
//! field.  No partial acceptance: the typed [`BatchEnvelope`] is only
//! constructed once every check has passed.  Leaf-field semantics (required
//! fields per op, target shapes) are preflight's job, not this module's.

use crate::{
    BatchEnvelope, DocTarget, MAX_OP_DELAY_MS, OnErrorPolicy, Operation, REF_ASSIGN_FIELDS,
    SafetyOptions, is_valid_ref_name,
};
use obx_error::{ErrorCode, ExecError};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Keys accepted under the envelope's `safety` object.
const SAFETY_KEYS: &[&str] = &[
    "dryRun",
    "checkpoint",
    "rollbackOnError",
    "onError",
    "continueOnError",
    "opDelayMs",
];

/// A structural problem found in an envelope. Fatal: no ops run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// A value that must be a JSON object is not one.
    #[error("{what} must be an object")]
    NotAnObject {
        /// Path of the offending value (e.g. `"envelope"`, `"ops[3]"`).
        what: String,
    },

    /// A required field is absent.
    #[error("missing required field: {field}")]
    MissingField {
        /// Path of the missing field.
        field: String,
    },

    /// A field is present but has the wrong type or an empty value.
    #[error("{field} must be {expected}")]
    InvalidField {
        /// Path of the offending field.
        field: String,
        /// Description of what was expected.
        expected: String,
    },

    /// The `ops` sequence is empty.
    #[error("ops must be a non-empty array")]
    EmptyOps,

    /// The `safety` object carries a key outside the recognized set.
    #[error("safety has unrecognized key: {key}")]
    UnknownSafetyKey {
        /// The offending key.
        key: String,
    },

    /// A ref name (seeded or assigned) violates the ref-name grammar.
    #[error("{field} is not a valid ref name: \"{name}\"")]
    BadRefName {
        /// Path of the offending field.
        field: String,
        /// The rejected name.
        name: String,
    },
}

impl EnvelopeError {
    /// Lift this structural failure into the unified taxonomy.
    pub fn into_exec_error(self) -> ExecError {
        ExecError::new(ErrorCode::EnvelopeInvalid, self.to_string())
    }
}

/// JSON truthiness, for the legacy boolean-ish safety flags.
fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Validate a raw JSON envelope and produce the typed [`BatchEnvelope`].
///
/// Checks run in the documented order and stop at the first failure.
///
/// # Errors
///
/// [`EnvelopeError`] naming the first offending field.
///
/// # Examples
///
/// ```
/// use obx_core::envelope::parse_envelope;
/// use serde_json::json;
///
/// let env = parse_envelope(&json!({
///     "transactionId": "t1",
///     "doc": { "ref": "active" },
///     "ops": [{ "op": "createLayer", "name": "A" }]
/// }))
/// .unwrap();
/// assert_eq!(env.ops.len(), 1);
/// ```
pub fn parse_envelope(raw: &Value) -> Result<BatchEnvelope, EnvelopeError> {
    let root = raw.as_object().ok_or_else(|| EnvelopeError::NotAnObject {
        what: "envelope".into(),
    })?;

    // transactionId: non-empty string.
    let transaction_id = match root.get("transactionId") {
        None | Some(Value::Null) => {
            return Err(EnvelopeError::MissingField {
                field: "transactionId".into(),
            });
        }
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(_) => {
            return Err(EnvelopeError::InvalidField {
                field: "transactionId".into(),
                expected: "a non-empty string".into(),
            });
        }
    };

    // doc: object with non-empty doc.ref.
    let doc = match root.get("doc") {
        None | Some(Value::Null) => {
            return Err(EnvelopeError::MissingField { field: "doc".into() });
        }
        Some(Value::Object(d)) => match d.get("ref") {
            Some(Value::String(s)) if !s.is_empty() => DocTarget { doc_ref: s.clone() },
            _ => {
                return Err(EnvelopeError::InvalidField {
                    field: "doc.ref".into(),
                    expected: "a non-empty string".into(),
                });
            }
        },
        Some(_) => {
            return Err(EnvelopeError::NotAnObject { what: "doc".into() });
        }
    };

    // ops: non-empty array of objects, each with a non-empty string `op`.
    let raw_ops = match root.get("ops") {
        None | Some(Value::Null) => {
            return Err(EnvelopeError::MissingField { field: "ops".into() });
        }
        Some(Value::Array(a)) if !a.is_empty() => a,
        Some(Value::Array(_)) => return Err(EnvelopeError::EmptyOps),
        Some(_) => {
            return Err(EnvelopeError::InvalidField {
                field: "ops".into(),
                expected: "a non-empty array".into(),
            });
        }
    };

    let mut ops = Vec::with_capacity(raw_ops.len());
    for (i, raw_op) in raw_ops.iter().enumerate() {
        let obj = raw_op.as_object().ok_or_else(|| EnvelopeError::NotAnObject {
            what: format!("ops[{i}]"),
        })?;

        match obj.get("op") {
            Some(Value::String(s)) if !s.is_empty() => {}
            _ => {
                return Err(EnvelopeError::InvalidField {
                    field: format!("ops[{i}].op"),
                    expected: "a non-empty string".into(),
                });
            }
        }

        if let Some(v) = obj.get("onError") {
            let ok = v.as_str().is_some_and(|s| OnErrorPolicy::parse_ci(s).is_some());
            if !ok {
                return Err(EnvelopeError::InvalidField {
                    field: format!("ops[{i}].onError"),
                    expected: r#""abort" or "continue""#.into(),
                });
            }
        }

        // The first-wins ref-assignment field, when present, must be a
        // string satisfying the ref-name grammar.
        if let Some(field) = REF_ASSIGN_FIELDS.iter().find(|f| obj.contains_key(**f)) {
            match obj.get(*field) {
                Some(Value::String(s)) if is_valid_ref_name(s) => {}
                Some(Value::String(s)) => {
                    return Err(EnvelopeError::BadRefName {
                        field: format!("ops[{i}].{field}"),
                        name: s.clone(),
                    });
                }
                _ => {
                    return Err(EnvelopeError::InvalidField {
                        field: format!("ops[{i}].{field}"),
                        expected: "a ref name string".into(),
                    });
                }
            }
        }

        ops.push(Operation {
            payload: obj.clone(),
        });
    }

    // safety: recognized keys only, typed onError / opDelayMs.
    let safety = match root.get("safety") {
        None | Some(Value::Null) => SafetyOptions::default(),
        Some(Value::Object(s)) => {
            for key in s.keys() {
                if !SAFETY_KEYS.contains(&key.as_str()) {
                    return Err(EnvelopeError::UnknownSafetyKey { key: key.clone() });
                }
            }

            let on_error = match s.get("onError") {
                None | Some(Value::Null) => None,
                Some(v) => match v.as_str().and_then(OnErrorPolicy::parse_ci) {
                    Some(p) => Some(p),
                    None => {
                        return Err(EnvelopeError::InvalidField {
                            field: "safety.onError".into(),
                            expected: r#""abort" or "continue""#.into(),
                        });
                    }
                },
            };

            let op_delay_ms = match s.get("opDelayMs") {
                None | Some(Value::Null) => None,
                Some(v) => match v.as_u64() {
                    Some(ms) if ms <= MAX_OP_DELAY_MS => Some(ms),
                    _ => {
                        return Err(EnvelopeError::InvalidField {
                            field: "safety.opDelayMs".into(),
                            expected: format!("an integer in [0, {MAX_OP_DELAY_MS}]"),
                        });
                    }
                },
            };

            SafetyOptions {
                dry_run: s.get("dryRun").is_some_and(truthy),
                checkpoint: s.get("checkpoint").is_some_and(truthy),
                rollback_on_error: s.get("rollbackOnError").is_some_and(truthy),
                on_error,
                continue_on_error: s.get("continueOnError").is_some_and(truthy),
                op_delay_ms,
            }
        }
        Some(_) => {
            return Err(EnvelopeError::NotAnObject {
                what: "safety".into(),
            });
        }
    };

    // Pre-seeded refs: keys must satisfy the ref-name grammar.
    let mut refs = BTreeMap::new();
    if let Some(v) = root.get("refs") {
        let seeded = v.as_object().ok_or_else(|| EnvelopeError::NotAnObject {
            what: "refs".into(),
        })?;
        for (name, value) in seeded {
            if !is_valid_ref_name(name) {
                return Err(EnvelopeError::BadRefName {
                    field: "refs".into(),
                    name: name.clone(),
                });
            }
            refs.insert(name.clone(), value.clone());
        }
    }

    Ok(BatchEnvelope {
        transaction_id,
        doc,
        refs,
        ops,
        safety,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Value {
        json!({
            "transactionId": "t1",
            "doc": { "ref": "active" },
            "ops": [{ "op": "createLayer" }]
        })
    }

    #[test]
    fn accepts_minimal_envelope() {
        let env = parse_envelope(&minimal()).unwrap();
        assert_eq!(env.transaction_id, "t1");
        assert_eq!(env.doc.doc_ref, "active");
        assert_eq!(env.ops.len(), 1);
        assert!(!env.safety.dry_run);
        assert!(env.refs.is_empty());
    }

    #[test]
    fn rejects_non_object_envelope() {
        let err = parse_envelope(&json!([1, 2])).unwrap_err();
        assert_eq!(err.to_string(), "envelope must be an object");
    }

    #[test]
    fn rejects_missing_transaction_id() {
        let mut v = minimal();
        v.as_object_mut().unwrap().remove("transactionId");
        let err = parse_envelope(&v).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingField { ref field } if field == "transactionId"));
    }

    #[test]
    fn rejects_empty_transaction_id() {
        let mut v = minimal();
        v["transactionId"] = json!("");
        let err = parse_envelope(&v).unwrap_err();
        assert!(err.to_string().contains("transactionId"));
    }

    #[test]
    fn rejects_missing_doc_ref() {
        let mut v = minimal();
        v["doc"] = json!({});
        let err = parse_envelope(&v).unwrap_err();
        assert!(err.to_string().contains("doc.ref"));
    }

    #[test]
    fn rejects_empty_ops() {
        let mut v = minimal();
        v["ops"] = json!([]);
        assert_eq!(parse_envelope(&v).unwrap_err(), EnvelopeError::EmptyOps);
    }

    #[test]
    fn rejects_op_without_name() {
        let mut v = minimal();
        v["ops"] = json!([{ "op": "createLayer" }, { "name": "A" }]);
        let err = parse_envelope(&v).unwrap_err();
        assert!(err.to_string().contains("ops[1].op"));
    }

    #[test]
    fn rejects_bad_on_error() {
        let mut v = minimal();
        v["ops"][0]["onError"] = json!("retry");
        let err = parse_envelope(&v).unwrap_err();
        assert!(err.to_string().contains("ops[0].onError"));
    }

    #[test]
    fn accepts_case_insensitive_on_error() {
        let mut v = minimal();
        v["ops"][0]["onError"] = json!("Continue");
        let env = parse_envelope(&v).unwrap();
        assert_eq!(env.ops[0].on_error(), Some(OnErrorPolicy::Continue));
    }

    #[test]
    fn rejects_unknown_safety_key() {
        let mut v = minimal();
        v["safety"] = json!({ "dryRun": true, "atomic": true });
        let err = parse_envelope(&v).unwrap_err();
        assert_eq!(err, EnvelopeError::UnknownSafetyKey { key: "atomic".into() });
    }

    #[test]
    fn rejects_out_of_range_op_delay() {
        let mut v = minimal();
        v["safety"] = json!({ "opDelayMs": 60001 });
        let err = parse_envelope(&v).unwrap_err();
        assert!(err.to_string().contains("opDelayMs"));
    }

    #[test]
    fn rejects_negative_op_delay() {
        let mut v = minimal();
        v["safety"] = json!({ "opDelayMs": -5 });
        assert!(parse_envelope(&v).is_err());
    }

    #[test]
    fn safety_flags_use_truthiness() {
        let mut v = minimal();
        v["safety"] = json!({ "continueOnError": 1, "dryRun": "" });
        let env = parse_envelope(&v).unwrap();
        assert!(env.safety.continue_on_error);
        assert!(!env.safety.dry_run);
    }

    #[test]
    fn rejects_bad_ref_assignment_name() {
        let mut v = minimal();
        v["ops"][0]["as"] = json!("1bad");
        let err = parse_envelope(&v).unwrap_err();
        assert!(matches!(err, EnvelopeError::BadRefName { .. }));
    }

    #[test]
    fn rejects_bad_seeded_ref_name() {
        let mut v = minimal();
        v["refs"] = json!({ "9lives": { "kind": "layer" } });
        let err = parse_envelope(&v).unwrap_err();
        assert!(matches!(err, EnvelopeError::BadRefName { .. }));
    }

    #[test]
    fn keeps_seeded_refs() {
        let mut v = minimal();
        v["refs"] = json!({ "bg": { "kind": "layer", "layerId": 7 } });
        let env = parse_envelope(&v).unwrap();
        assert_eq!(env.refs["bg"]["layerId"], json!(7));
    }

    #[test]
    fn first_failure_wins_over_later_ones() {
        // Both transactionId and ops are broken; transactionId is checked
        // first and must be the reported failure.
        let v = json!({ "transactionId": 7, "doc": { "ref": "active" }, "ops": [] });
        let err = parse_envelope(&v).unwrap_err();
        assert!(err.to_string().contains("transactionId"));
    }
}
