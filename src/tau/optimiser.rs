use std::collections::{BTreeMap, HashMap};

use super::parser::{Anchor, BoolOp, Expression, Fused, Match, Scalar};

/// Inlines every `Identifier` with the expression bound to it. Rules clear
/// their identifier map straight after this pass; an identifier the parser
/// did not validate cannot occur.
pub fn coalesce(
    expression: Expression,
    identifiers: &BTreeMap<String, Expression>,
) -> Expression {
    match expression {
        Expression::Identifier(name) => identifiers.get(&name).cloned().unwrap_or_default(),
        Expression::Group(op, expressions) => Expression::Group(
            op,
            expressions
                .into_iter()
                .map(|e| coalesce(e, identifiers))
                .collect(),
        ),
        Expression::Negate(inner) => {
            Expression::Negate(Box::new(coalesce(*inner, identifiers)))
        }
        Expression::Nested(field, inner) => {
            Expression::Nested(field, Box::new(coalesce(*inner, identifiers)))
        }
        expression => expression,
    }
}

/// Rebuilds a group applying the unit and absorption laws and flattening
/// same-operator children. Empty `and` is true, empty `or` is false.
fn group(op: BoolOp, expressions: Vec<Expression>) -> Expression {
    let mut scratch = vec![];
    for expression in expressions {
        match expression {
            Expression::Group(inner, expressions) if inner == op => scratch.extend(expressions),
            Expression::Boolean(b) => match (op, b) {
                (BoolOp::And, false) => return Expression::Boolean(false),
                (BoolOp::Or, true) => return Expression::Boolean(true),
                (_, _) => {}
            },
            expression => scratch.push(expression),
        }
    }
    if scratch.is_empty() {
        Expression::Boolean(op == BoolOp::And)
    } else if scratch.len() == 1 {
        scratch.remove(0)
    } else {
        Expression::Group(op, scratch)
    }
}

/// Dead code elimination and constant folding.
pub fn shake(expression: Expression) -> Expression {
    match expression {
        Expression::Group(op, expressions) => {
            group(op, expressions.into_iter().map(shake).collect())
        }
        Expression::Negate(inner) => match shake(*inner) {
            Expression::Boolean(b) => Expression::Boolean(!b),
            inner => Expression::Negate(Box::new(inner)),
        },
        Expression::Nested(field, inner) => Expression::Nested(field, Box::new(shake(*inner))),
        expression => expression,
    }
}

/// Canonicalises negations: double negations are dropped and the rest pushed
/// inwards by De Morgan, which never duplicates subtrees.
pub fn rewrite(expression: Expression) -> Expression {
    match expression {
        Expression::Negate(inner) => match *inner {
            Expression::Negate(inner) => rewrite(*inner),
            Expression::Boolean(b) => Expression::Boolean(!b),
            Expression::Group(op, expressions) => {
                let flipped = match op {
                    BoolOp::And => BoolOp::Or,
                    BoolOp::Or => BoolOp::And,
                };
                group(
                    flipped,
                    expressions
                        .into_iter()
                        .map(|e| rewrite(Expression::Negate(Box::new(e))))
                        .collect(),
                )
            }
            inner => Expression::Negate(Box::new(rewrite(inner))),
        },
        Expression::Group(op, expressions) => {
            group(op, expressions.into_iter().map(rewrite).collect())
        }
        Expression::Nested(field, inner) => Expression::Nested(field, Box::new(rewrite(*inner))),
        expression => expression,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Family {
    Text(bool),
    Value,
}

fn family(matcher: &Match) -> Option<Family> {
    match matcher {
        Match::Equal(Scalar::String(s), fold) if !s.is_empty() => Some(Family::Text(*fold)),
        Match::Contains(s, fold) | Match::StartsWith(s, fold) | Match::EndsWith(s, fold)
            if !s.is_empty() =>
        {
            Some(Family::Text(*fold))
        }
        Match::Equal(Scalar::String(_), _) => None,
        Match::Equal(_, _) => Some(Family::Value),
        _ => None,
    }
}

fn anchors(matches: &[Match]) -> Vec<(Anchor, String)> {
    matches
        .iter()
        .map(|matcher| match matcher {
            Match::Equal(Scalar::String(s), _) => (Anchor::Exact, s.clone()),
            Match::Contains(s, _) => (Anchor::Contains, s.clone()),
            Match::StartsWith(s, _) => (Anchor::StartsWith, s.clone()),
            Match::EndsWith(s, _) => (Anchor::EndsWith, s.clone()),
            _ => unreachable!("only text matches are anchored"),
        })
        .collect()
}

fn combine(op: BoolOp, family: Family, matches: Vec<Match>) -> Match {
    match family {
        Family::Text(fold) => {
            let all = op == BoolOp::And;
            match Fused::new(anchors(&matches), fold, all) {
                Some(fused) => Match::Fused(fused),
                None if all => Match::AllOf(matches),
                None => Match::OneOf(matches),
            }
        }
        Family::Value => match op {
            BoolOp::Or => Match::In(
                matches
                    .into_iter()
                    .map(|matcher| match matcher {
                        Match::Equal(scalar, _) => scalar,
                        _ => unreachable!("only equalities are fused into sets"),
                    })
                    .collect(),
                false,
            ),
            BoolOp::And => Match::AllOf(matches),
        },
    }
}

/// Turns a parse-time `OneOf`/`AllOf` list into its fused representation
/// when every member is combinable.
fn compress(matcher: Match) -> Match {
    let (matches, all) = match matcher {
        Match::OneOf(matches) => (matches, false),
        Match::AllOf(matches) => (matches, true),
        matcher => return matcher,
    };
    if matches.len() < 2 {
        return if all {
            Match::AllOf(matches)
        } else {
            Match::OneOf(matches)
        };
    }
    let mut families = matches.iter().map(family);
    let first = families.next().expect("checked for length above");
    if first.is_some() && families.all(|f| f == first) {
        let family = first.expect("checked above");
        let op = if all { BoolOp::And } else { BoolOp::Or };
        if matches!(family, Family::Value) && all {
            return Match::AllOf(matches);
        }
        return combine(op, family, matches);
    }
    if all {
        Match::AllOf(matches)
    } else {
        Match::OneOf(matches)
    }
}

enum Slot {
    Keep(Expression),
    Bucket(usize),
}

/// Fuses sibling predicates over the same field into a single match: an `or`
/// of text matches becomes one multi-pattern matcher, an `or` of equalities a
/// set lookup, an `and` the all-of forms.
pub fn matrix(expression: Expression) -> Expression {
    match expression {
        Expression::Group(op, expressions) => {
            let expressions: Vec<Expression> = expressions.into_iter().map(matrix).collect();
            let mut slots = vec![];
            let mut buckets: Vec<(String, Family, Vec<Match>)> = vec![];
            let mut lookup: HashMap<(String, Family), usize> = HashMap::new();
            for expression in expressions {
                let key = match &expression {
                    Expression::Field(path, matcher) => {
                        family(matcher).map(|f| (path.clone(), f))
                    }
                    _ => None,
                };
                match key {
                    Some(key) => {
                        let matcher = match expression {
                            Expression::Field(_, matcher) => matcher,
                            _ => unreachable!("checked above"),
                        };
                        match lookup.get(&key) {
                            Some(&index) => buckets[index].2.push(matcher),
                            None => {
                                let index = buckets.len();
                                slots.push(Slot::Bucket(index));
                                buckets.push((key.0.clone(), key.1.clone(), vec![matcher]));
                                lookup.insert(key, index);
                            }
                        }
                    }
                    None => slots.push(Slot::Keep(expression)),
                }
            }
            let mut buckets: Vec<Option<(String, Family, Vec<Match>)>> =
                buckets.into_iter().map(Some).collect();
            let rebuilt = slots
                .into_iter()
                .map(|slot| match slot {
                    Slot::Keep(expression) => expression,
                    Slot::Bucket(index) => {
                        let (path, family, mut matches) =
                            buckets[index].take().expect("bucket used once");
                        if matches.len() == 1 {
                            Expression::Field(path, matches.remove(0))
                        } else {
                            Expression::Field(path, combine(op, family, matches))
                        }
                    }
                })
                .collect();
            group(op, rebuilt)
        }
        Expression::Negate(inner) => Expression::Negate(Box::new(matrix(*inner))),
        Expression::Nested(field, inner) => Expression::Nested(field, Box::new(matrix(*inner))),
        Expression::Field(field, matcher) => Expression::Field(field, compress(matcher)),
        expression => expression,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tau::parser::parse_detection;
    use crate::tau::{Document, solve};

    fn optimise(detection: crate::tau::Detection) -> Expression {
        let expression = coalesce(detection.expression, &detection.identifiers);
        let expression = shake(expression);
        let expression = rewrite(expression);
        matrix(expression)
    }

    fn detection(text: &str) -> crate::tau::Detection {
        parse_detection(&serde_yaml::from_str(text).unwrap(), false).unwrap()
    }

    fn document(json: &str) -> crate::value::Value {
        serde_json::from_str(json).unwrap()
    }

    const RULE: &str = r#"
        A:
            EventID: 4624
            LogonType: 3
        B:
            CommandLine|contains:
            - mimikatz
            - seatbelt
        C:
            User: SYSTEM
        condition: (A and not (B or C)) or (A and B)
    "#;

    #[test]
    fn optimiser_is_idempotent() {
        let first = optimise(detection(RULE));
        let second = matrix(rewrite(shake(coalesce(
            first.clone(),
            &BTreeMap::new(),
        ))));
        assert_eq!(first, second);
    }

    #[test]
    fn optimiser_preserves_semantics() {
        let parsed = detection(RULE);
        let optimised = optimise(parsed.clone());
        let unoptimised = coalesce(parsed.expression, &parsed.identifiers);
        let documents = [
            r#"{"EventID": 4624, "LogonType": 3, "CommandLine": "run mimikatz now", "User": "bob"}"#,
            r#"{"EventID": 4624, "LogonType": 3, "CommandLine": "calc", "User": "bob"}"#,
            r#"{"EventID": 4624, "LogonType": 3, "CommandLine": "calc", "User": "SYSTEM"}"#,
            r#"{"EventID": 4625, "LogonType": 3, "CommandLine": "seatbelt", "User": "bob"}"#,
            r#"{"EventID": 4624, "LogonType": 2}"#,
            r#"{}"#,
        ];
        for text in documents {
            let value = document(text);
            assert_eq!(
                solve(&unoptimised, &value as &dyn Document),
                solve(&optimised, &value as &dyn Document),
                "{}",
                text
            );
        }
    }

    #[test]
    fn shake_folds_constants() {
        let expression = Expression::Group(
            BoolOp::And,
            vec![
                Expression::Boolean(true),
                Expression::Group(
                    BoolOp::And,
                    vec![Expression::Identifier("x".to_owned())],
                ),
            ],
        );
        assert_eq!(shake(expression), Expression::Identifier("x".to_owned()));

        let expression = Expression::Group(
            BoolOp::And,
            vec![
                Expression::Boolean(false),
                Expression::Identifier("x".to_owned()),
            ],
        );
        assert_eq!(shake(expression), Expression::Boolean(false));

        assert_eq!(
            shake(Expression::Group(BoolOp::And, vec![])),
            Expression::Boolean(true)
        );
        assert_eq!(
            shake(Expression::Group(BoolOp::Or, vec![])),
            Expression::Boolean(false)
        );
    }

    #[test]
    fn rewrite_cancels_double_negation() {
        let expression = Expression::Negate(Box::new(Expression::Negate(Box::new(
            Expression::Identifier("x".to_owned()),
        ))));
        assert_eq!(rewrite(expression), Expression::Identifier("x".to_owned()));
    }

    #[test]
    fn rewrite_pushes_negations_inward() {
        let expression = Expression::Negate(Box::new(Expression::Group(
            BoolOp::And,
            vec![
                Expression::Identifier("x".to_owned()),
                Expression::Identifier("y".to_owned()),
            ],
        )));
        assert_eq!(
            rewrite(expression),
            Expression::Group(
                BoolOp::Or,
                vec![
                    Expression::Negate(Box::new(Expression::Identifier("x".to_owned()))),
                    Expression::Negate(Box::new(Expression::Identifier("y".to_owned()))),
                ]
            )
        );
    }

    #[test]
    fn matrix_fuses_same_path_fields() {
        let parsed = detection(
            r#"
            A:
                Image|endswith: \rundll32.exe
            B:
                Image|endswith: \regsvr32.exe
            condition: A or B
            "#,
        );
        let optimised = optimise(parsed);
        match optimised {
            Expression::Field(field, Match::Fused(fused)) => {
                assert_eq!(field, "Image");
                assert!(!fused.all());
                assert_eq!(fused.patterns().len(), 2);
            }
            expression => panic!("expected a fused field, got {:?}", expression),
        }
    }

    #[test]
    fn matrix_fuses_equality_sets() {
        let parsed = detection(
            r#"
            A:
                EventID: 4624
            B:
                EventID: 4625
            condition: A or B
            "#,
        );
        let optimised = optimise(parsed);
        assert_eq!(
            optimised,
            Expression::Field(
                "EventID".to_owned(),
                Match::In(vec![Scalar::UInt(4624), Scalar::UInt(4625)], false)
            )
        );
    }

    #[test]
    fn matrix_keeps_unrelated_fields_apart() {
        let parsed = detection(
            r#"
            A:
                EventID: 4624
            B:
                LogonType: 3
            condition: A or B
            "#,
        );
        let optimised = optimise(parsed);
        match optimised {
            Expression::Group(BoolOp::Or, expressions) => assert_eq!(expressions.len(), 2),
            expression => panic!("expected a group, got {:?}", expression),
        }
    }

    #[test]
    fn matrix_respects_folding_regimes() {
        let parsed = detection(
            r#"
            A:
                Image|contains: foo
            B:
                Image|contains|i: bar
            condition: A or B
            "#,
        );
        let optimised = optimise(parsed);
        match optimised {
            Expression::Group(BoolOp::Or, expressions) => assert_eq!(expressions.len(), 2),
            expression => panic!("expected a group, got {:?}", expression),
        }
    }

    #[test]
    fn compress_fuses_parsed_lists() {
        let parsed = detection(
            r#"
            A:
                CommandLine|contains|all:
                - " -enc "
                - " -nop "
            condition: A
            "#,
        );
        let optimised = optimise(parsed);
        match optimised {
            Expression::Field(_, Match::Fused(fused)) => assert!(fused.all()),
            expression => panic!("expected a fused field, got {:?}", expression),
        }
    }
}
