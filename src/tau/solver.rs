use std::cmp::Ordering;

use super::parser::{BoolOp, Expression, Match, MatchKind, Number, Scalar};
use super::{Document, Value};

/// Evaluates an expression against a document. Anything the expression
/// cannot make sense of, a missing field, a type that does not coerce, is
/// simply false; evaluation never fails.
pub fn solve(expression: &Expression, document: &dyn Document) -> bool {
    match expression {
        Expression::Boolean(b) => *b,
        Expression::Cast(field) => document
            .find(field)
            .map(|value| value.to_truthy())
            .unwrap_or(false),
        Expression::Field(field, matcher) => document
            .find(field)
            .map(|value| matches(matcher, &value))
            .unwrap_or(false),
        Expression::Group(BoolOp::And, expressions) => {
            expressions.iter().all(|e| solve(e, document))
        }
        Expression::Group(BoolOp::Or, expressions) => {
            expressions.iter().any(|e| solve(e, document))
        }
        // Identifiers are inlined at load time, an unresolved one cannot hold.
        Expression::Identifier(_) => false,
        Expression::Missing(field) => document.find(field).is_none(),
        Expression::Negate(inner) => !solve(inner, document),
        Expression::Nested(field, inner) => match document.find(field) {
            Some(Value::Object(object)) => solve(inner, object),
            Some(Value::Array(array)) => array.iter().any(|value| match value {
                crate::value::Value::Object(object) => solve(inner, object),
                _ => false,
            }),
            _ => false,
        },
        Expression::Null(field) => matches!(document.find(field), Some(Value::Null)),
        Expression::Search(kind, fold) => document
            .as_text()
            .map(|text| search(kind, *fold, &text))
            .unwrap_or(false),
    }
}

fn matches(matcher: &Match, value: &Value) -> bool {
    match matcher {
        Match::AllOf(matches_) => return matches_.iter().all(|m| matches(m, value)),
        Match::OneOf(matches_) => return matches_.iter().any(|m| matches(m, value)),
        Match::Fused(fused) if fused.all() => {
            // A fused conjunction over an array must let each pattern hit a
            // different element, just like the conjunction it replaced.
            if let Value::Array(array) = value {
                return fused
                    .matches_seq(array.iter().filter_map(|v| Value::from(v).to_display()));
            }
        }
        _ => {}
    }
    if let Value::Array(array) = value {
        return array.iter().any(|v| matches(matcher, &v.into()));
    }
    match matcher {
        Match::Equal(scalar, fold) => equal(scalar, *fold, value),
        Match::Contains(needle, fold) => text(value, *fold)
            .map(|haystack| haystack.contains(needle))
            .unwrap_or(false),
        Match::StartsWith(needle, fold) => text(value, *fold)
            .map(|haystack| haystack.starts_with(needle))
            .unwrap_or(false),
        Match::EndsWith(needle, fold) => text(value, *fold)
            .map(|haystack| haystack.ends_with(needle))
            .unwrap_or(false),
        Match::Regex(regex) => value
            .to_display()
            .map(|haystack| regex.is_match(&haystack))
            .unwrap_or(false),
        Match::GreaterThan(number) => {
            matches!(compare(value, number), Some(Ordering::Greater))
        }
        Match::GreaterThanOrEqual(number) => matches!(
            compare(value, number),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        Match::LessThan(number) => matches!(compare(value, number), Some(Ordering::Less)),
        Match::LessThanOrEqual(number) => matches!(
            compare(value, number),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        Match::In(scalars, fold) => scalars.iter().any(|scalar| equal(scalar, *fold, value)),
        Match::Fused(fused) => value
            .to_display()
            .map(|haystack| fused.matches(&haystack))
            .unwrap_or(false),
        Match::AllOf(_) | Match::OneOf(_) => unreachable!("handled above"),
    }
}

fn text(value: &Value, fold: bool) -> Option<String> {
    let display = value.to_display()?;
    if fold {
        Some(display.to_lowercase())
    } else {
        Some(display)
    }
}

fn equal(scalar: &Scalar, fold: bool, value: &Value) -> bool {
    match scalar {
        Scalar::Null => matches!(value, Value::Null),
        Scalar::Bool(b) => matches!(value, Value::Bool(x) if x == b),
        Scalar::String(s) => match value {
            // The needle was folded at parse time, only the document side
            // folds here.
            Value::String(x) => {
                if fold {
                    x.to_lowercase() == *s
                } else {
                    x.as_ref() == s
                }
            }
            Value::Bool(_) | Value::Int(_) | Value::UInt(_) | Value::Float(_) => text(value, fold)
                .map(|x| x == *s)
                .unwrap_or(false),
            _ => false,
        },
        Scalar::Int(i) => match value {
            Value::Int(x) => x == i,
            Value::UInt(x) => i64::try_from(*x).map(|x| x == *i).unwrap_or(false),
            Value::Float(x) => *x == *i as f64,
            _ => false,
        },
        Scalar::UInt(u) => match value {
            Value::UInt(x) => x == u,
            Value::Int(x) => u64::try_from(*x).map(|x| x == *u).unwrap_or(false),
            Value::Float(x) => *x == *u as f64,
            _ => false,
        },
        Scalar::Float(f) => match value {
            Value::Float(x) => x == f,
            Value::Int(x) => *x as f64 == *f,
            Value::UInt(x) => *x as f64 == *f,
            _ => false,
        },
    }
}

fn compare(value: &Value, number: &Number) -> Option<Ordering> {
    match (value, number) {
        (Value::Int(x), Number::Int(y)) => Some(x.cmp(y)),
        (Value::Int(x), Number::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::UInt(x), Number::Int(y)) => {
            if *y < 0 {
                Some(Ordering::Greater)
            } else {
                Some(x.cmp(&(*y as u64)))
            }
        }
        (Value::UInt(x), Number::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Number::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Float(x), Number::Float(y)) => x.partial_cmp(y),
        (_, _) => None,
    }
}

fn search(kind: &MatchKind, fold: bool, value: &str) -> bool {
    let folded;
    let haystack = if fold {
        folded = value.to_lowercase();
        folded.as_str()
    } else {
        value
    };
    match kind {
        MatchKind::Exact(needle) => haystack == needle,
        MatchKind::Contains(needle) => haystack.contains(needle),
        MatchKind::StartsWith(needle) => haystack.starts_with(needle),
        MatchKind::EndsWith(needle) => haystack.ends_with(needle),
        MatchKind::Regex(regex) => regex.is_match(value),
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::{parse_detection, parse_kv};
    use super::super::{Document, optimiser};
    use super::*;

    fn document(json: &str) -> crate::value::Value {
        serde_json::from_str(json).unwrap()
    }

    fn solves(kv: &str, json: &str) -> bool {
        let expression = parse_kv(kv).unwrap();
        let value = document(json);
        solve(&expression, &value as &dyn Document)
    }

    #[test]
    fn equality() {
        assert!(solves("EventID: 4624", r#"{"EventID": 4624}"#));
        assert!(!solves("EventID: 4624", r#"{"EventID": 4625}"#));
        assert!(!solves("EventID: 4624", r#"{}"#));
        assert!(solves("User: SYSTEM", r#"{"User": "SYSTEM"}"#));
        assert!(!solves("User: SYSTEM", r#"{"User": "system"}"#));
        assert!(solves("User|i: SYSTEM", r#"{"User": "system"}"#));
        assert!(solves("Enabled: true", r#"{"Enabled": true}"#));
    }

    #[test]
    fn equality_coerces_scalars_to_text() {
        let expression = crate::tau::parse_expression(
            &serde_yaml::from_str(r#"{"EventID": "4624"}"#).unwrap(),
            false,
        )
        .unwrap();
        let value = document(r#"{"EventID": 4624}"#);
        assert!(solve(&expression, &value as &dyn Document));
        assert!(!solves("EventID: 4624", r#"{"EventID": "4624"}"#));
    }

    #[test]
    fn dotted_paths() {
        assert!(solves(
            "Event.System.EventID: 1",
            r#"{"Event": {"System": {"EventID": 1}}}"#
        ));
        assert!(!solves("Event.System.EventID: 1", r#"{"Event": []}"#));
    }

    #[test]
    fn text_kinds() {
        assert!(solves("x: *foo*", r#"{"x": "a foo b"}"#));
        assert!(solves("x: foo*", r#"{"x": "foobar"}"#));
        assert!(solves("x: *foo", r#"{"x": "barfoo"}"#));
        assert!(!solves("x: foo*", r#"{"x": "barfoo"}"#));
        assert!(solves("x|re: ^a.c$", r#"{"x": "abc"}"#));
    }

    #[test]
    fn comparators() {
        assert!(solves("x|gt: 5", r#"{"x": 6}"#));
        assert!(!solves("x|gt: 5", r#"{"x": 5}"#));
        assert!(solves("x|gte: 5", r#"{"x": 5}"#));
        assert!(solves("x|lt: 5", r#"{"x": 4.5}"#));
        assert!(solves("x|lte: -1", r#"{"x": -2}"#));
        // Types are never guessed on the document side.
        assert!(!solves("x|gt: 5", r#"{"x": "6"}"#));
    }

    #[test]
    fn arrays_match_any_element() {
        assert!(solves("x: foo", r#"{"x": ["bar", "foo"]}"#));
        assert!(!solves("x: foo", r#"{"x": ["bar", "baz"]}"#));
    }

    #[test]
    fn nested_rebase() {
        let detection = parse_detection(
            &serde_yaml::from_str(
                r#"
                A:
                    Payload:
                        Action: block
                condition: A
                "#,
            )
            .unwrap(),
            false,
        )
        .unwrap();
        let expression =
            optimiser::coalesce(detection.expression, &detection.identifiers);
        let hit = document(r#"{"Payload": {"Action": "block"}}"#);
        let array_hit = document(r#"{"Payload": [{"Action": "allow"}, {"Action": "block"}]}"#);
        let miss = document(r#"{"Payload": {"Action": "allow"}}"#);
        let scalar = document(r#"{"Payload": "block"}"#);
        assert!(solve(&expression, &hit as &dyn Document));
        assert!(solve(&expression, &array_hit as &dyn Document));
        assert!(!solve(&expression, &miss as &dyn Document));
        assert!(!solve(&expression, &scalar as &dyn Document));
    }

    #[test]
    fn contains_all_requires_every_needle() {
        let detection = parse_detection(
            &serde_yaml::from_str(
                r#"
                A:
                    CommandLine|contains|all:
                    - " -enc "
                    - " -nop "
                condition: A
                "#,
            )
            .unwrap(),
            false,
        )
        .unwrap();
        let expression =
            optimiser::coalesce(detection.expression, &detection.identifiers);
        let both = document(r#"{"CommandLine": "ps -enc x -nop y"}"#);
        let one = document(r#"{"CommandLine": "ps -enc x"}"#);
        assert!(solve(&expression, &both as &dyn Document));
        assert!(!solve(&expression, &one as &dyn Document));

        // The fused representation behaves identically.
        let fused = optimiser::matrix(expression);
        assert!(solve(&fused, &both as &dyn Document));
        assert!(!solve(&fused, &one as &dyn Document));
    }

    #[test]
    fn search_matches_document_text() {
        let expression = Expression::Search(MatchKind::Contains("mimikatz".to_owned()), false);
        let hit = document(r#"{"a": {"b": "x mimikatz y"}}"#);
        let miss = document(r#"{"a": {"b": "calc"}}"#);
        assert!(solve(&expression, &hit as &dyn Document));
        assert!(!solve(&expression, &miss as &dyn Document));
    }

    #[test]
    fn null_and_missing() {
        assert!(solves("x: null", r#"{"x": null}"#));
        assert!(solves("x: null", r#"{}"#));
        assert!(!solves("x: null", r#"{"x": 1}"#));
    }

    #[test]
    fn empty_groups() {
        let value = document(r#"{}"#);
        assert!(solve(
            &Expression::Group(BoolOp::And, vec![]),
            &value as &dyn Document
        ));
        assert!(!solve(
            &Expression::Group(BoolOp::Or, vec![]),
            &value as &dyn Document
        ));
    }
}
