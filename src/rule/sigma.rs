use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use base64::Engine;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value as Yaml};

use crate::tau;

use super::{Aggregate, Count, Level, Status};

/// A sigma-dialect rule translated into tau. A single file can hold several,
/// either as a YAML multi-doc or as a rule collection.
#[derive(Clone, Debug)]
pub struct Rule {
    pub name: String,
    pub detection: tau::Detection,

    pub aggregate: Option<Aggregate>,

    pub authors: Vec<String>,
    pub description: String,
    pub level: Level,
    pub status: Status,

    pub falsepositives: Option<Vec<String>>,
    pub id: Option<String>,
    pub logsource: Option<LogSource>,
    pub references: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogSource {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
struct Detection {
    #[serde(default)]
    pub condition: Option<Yaml>,
    #[serde(flatten)]
    pub identifiers: Mapping,
}

#[derive(Clone, Deserialize)]
struct Header {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub falsepositives: Option<Vec<String>>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub logsource: Option<LogSource>,
    #[serde(default)]
    pub references: Option<Vec<String>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Clone, Deserialize)]
struct Sigma {
    #[serde(default)]
    pub detection: Option<Detection>,
    #[serde(default, flatten)]
    pub header: Option<Header>,
    #[serde(default)]
    pub level: Option<String>,
}

// NOTE: We list the supported ones, so if any new ones appear we don't
// silently error.
lazy_static::lazy_static! {
    static ref SUPPORTED_MODIFIERS: HashSet<&'static str> = {
        let mut set = HashSet::new();
        set.insert("all");
        set.insert("base64");
        set.insert("base64offset");
        set.insert("contains");
        set.insert("endswith");
        set.insert("startswith");
        set.insert("re");
        set
    };
}

fn encode(value: &Yaml) -> Result<Yaml> {
    match value {
        Yaml::String(s) => Ok(Yaml::from(
            base64::engine::general_purpose::STANDARD.encode(s),
        )),
        Yaml::Sequence(sequence) => Ok(Yaml::Sequence(
            sequence.iter().map(encode).collect::<Result<Vec<_>>>()?,
        )),
        _ => anyhow::bail!("base64 modifiers require string values"),
    }
}

/// Encodes a needle at the three base64 block offsets, trimming the bleed at
/// either end so each variant matches regardless of alignment.
fn encode_offsets(value: &Yaml) -> Result<Yaml> {
    match value {
        Yaml::String(s) => {
            static S: [usize; 3] = [0, 2, 3];
            static E: [usize; 3] = [0, 3, 2];
            let mut scratch = Vec::with_capacity(3);
            for i in 0..3 {
                let mut shifted = " ".repeat(i);
                shifted.push_str(s);
                let encoded = base64::engine::general_purpose::STANDARD.encode(&shifted);
                let trimmed = encoded[S[i]..encoded.len() - E[shifted.len() % 3]].to_owned();
                scratch.push(Yaml::from(trimmed));
            }
            Ok(Yaml::Sequence(scratch))
        }
        Yaml::Sequence(sequence) => {
            let mut scratch = vec![];
            for entry in sequence {
                match encode_offsets(entry)? {
                    Yaml::Sequence(inner) => scratch.extend(inner),
                    value => scratch.push(value),
                }
            }
            Ok(Yaml::Sequence(scratch))
        }
        _ => anyhow::bail!("base64 modifiers require string values"),
    }
}

/// Validates a field's modifiers and expands the base64 ones, which are pure
/// string transforms; the rest stay on the key for the tau parser.
fn sanitise_field(key: &str, value: &Yaml) -> Result<(String, Yaml)> {
    let mut parts = key.split('|');
    let field = parts
        .next()
        .expect("split always yields one part")
        .to_owned();
    if field.is_empty() {
        anyhow::bail!("keyless identifiers cannot be converted");
    }
    let modifiers: Vec<&str> = parts.collect();
    let mut unsupported: Vec<String> = modifiers
        .iter()
        .filter(|m| !SUPPORTED_MODIFIERS.contains(*m))
        .map(|m| m.to_string())
        .collect();
    if !unsupported.is_empty() {
        unsupported.sort();
        return Err(anyhow!(unsupported.join(", ")).context("unsupported modifiers"));
    }
    if modifiers.contains(&"base64") && modifiers.contains(&"base64offset") {
        anyhow::bail!("base64 and base64offset are mutually exclusive");
    }
    let mut value = value.clone();
    if modifiers.contains(&"base64") {
        value = encode(&value)?;
    } else if modifiers.contains(&"base64offset") {
        value = encode_offsets(&value)?;
    }
    let kept: Vec<&str> = modifiers
        .into_iter()
        .filter(|m| *m != "base64" && *m != "base64offset")
        .collect();
    let key = if kept.is_empty() {
        field
    } else {
        format!("{}|{}", field, kept.join("|"))
    };
    Ok((key, value))
}

fn sanitise_block(value: &Yaml) -> Result<Yaml> {
    match value {
        Yaml::Mapping(mapping) => {
            let mut scratch = Mapping::new();
            for (key, value) in mapping {
                let key = key
                    .as_str()
                    .ok_or_else(|| anyhow!("keys must be strings"))?;
                let (key, value) = sanitise_field(key, value)?;
                scratch.insert(key.into(), value);
            }
            Ok(Yaml::Mapping(scratch))
        }
        Yaml::Sequence(sequence) => {
            if !sequence.is_empty() && sequence.iter().all(|e| e.as_mapping().is_some()) {
                Ok(Yaml::Sequence(
                    sequence
                        .iter()
                        .map(sanitise_block)
                        .collect::<Result<Vec<_>>>()?,
                ))
            } else {
                anyhow::bail!("keyless identifiers cannot be converted")
            }
        }
        _ => anyhow::bail!("identifier blocks must be a mapping or a sequence of mappings"),
    }
}

/// Splits an aggregation off the condition. Only `count` is supported:
/// `agg-function(agg-field) [ by group-field ] comparison-op value`.
fn prepare_condition(condition: &str) -> Result<(String, Option<Aggregate>)> {
    if let Some((condition, aggregate)) = condition.split_once(" | ") {
        let mut parts = aggregate.split_whitespace();
        let mut fields = vec![];
        match parts.next() {
            Some(kind) => {
                let rest = kind
                    .strip_prefix("count(")
                    .ok_or_else(|| anyhow!("unsupported agg function - {}", kind))?;
                let field = rest
                    .strip_suffix(')')
                    .ok_or_else(|| anyhow!("invalid agg function"))?;
                if !field.is_empty() {
                    fields.push(field.to_owned());
                }
            }
            None => anyhow::bail!("missing agg function"),
        }
        let mut part = parts.next().ok_or_else(|| anyhow!("invalid aggregation"))?;
        if part == "by" {
            let field = parts.next().ok_or_else(|| anyhow!("missing group field"))?;
            fields.push(field.to_owned());
            part = parts.next().ok_or_else(|| anyhow!("invalid aggregation"))?;
        }
        let number = parts.next().ok_or_else(|| anyhow!("invalid aggregation"))?;
        let count = Count::from_str(&format!("{}{}", part, number))?;
        Ok((condition.to_owned(), Some(Aggregate { count, fields })))
    } else {
        Ok((condition.to_owned(), None))
    }
}

/// Resolves the effective condition and identifier set for a rule, merging a
/// collection extension into its base where one applies.
fn prepare(detection: Detection, extra: Option<Detection>) -> Result<(Detection, Option<Aggregate>)> {
    let mut aggregate = None;
    let mut detection = detection;
    let condition = extra
        .as_ref()
        .and_then(|e| e.condition.clone())
        .or_else(|| detection.condition.clone());
    if let Some(c) = &condition {
        let condition = match c {
            Yaml::String(c) => c.clone(),
            Yaml::Sequence(s) => {
                if s.len() == 1 {
                    match s.first() {
                        Some(Yaml::String(c)) => c.clone(),
                        _ => anyhow::bail!("condition must be a string"),
                    }
                } else {
                    anyhow::bail!("condition must be a string");
                }
            }
            _ => anyhow::bail!("condition must be a string"),
        };
        let (condition, agg) = prepare_condition(&condition)?;
        aggregate = agg;

        let mut identifiers = detection.identifiers;
        if let Some(extension) = extra {
            for (k, v) in extension.identifiers {
                match identifiers.remove(&k) {
                    Some(base) => match (base, v) {
                        (Yaml::Mapping(mut m), Yaml::Mapping(v)) => {
                            for (x, y) in v {
                                m.insert(x, y);
                            }
                            identifiers.insert(k, Yaml::Mapping(m));
                        }
                        (Yaml::Sequence(s), Yaml::Mapping(v)) => {
                            let mut scratch = vec![];
                            for mut entry in s.into_iter() {
                                if let Some(m) = entry.as_mapping_mut() {
                                    for (x, y) in v.clone() {
                                        m.insert(x, y);
                                    }
                                }
                                scratch.push(entry);
                            }
                            identifiers.insert(k, Yaml::Sequence(scratch));
                        }
                        (_, _) => anyhow::bail!("unsupported rule collection format"),
                    },
                    None => {
                        identifiers.insert(k, v);
                    }
                }
            }
        }
        detection = Detection {
            condition: Some(Yaml::String(condition)),
            identifiers,
        }
    }
    Ok((detection, aggregate))
}

fn as_rule(
    header: &Header,
    level: &Option<String>,
    detection: Detection,
    extra: Option<Detection>,
) -> Result<Rule> {
    let (detection, aggregate) = prepare(detection, extra)?;
    let condition = match detection.condition {
        Some(Yaml::String(condition)) => condition
            .replace(" AND ", " and ")
            .replace(" NOT ", " not ")
            .replace(" OR ", " or "),
        _ => anyhow::bail!("missing condition"),
    };
    let mut mapping = Mapping::new();
    for (key, value) in &detection.identifiers {
        let key = key
            .as_str()
            .ok_or_else(|| anyhow!("identifiers must be strings"))?;
        if key == "timeframe" {
            // TODO: Support windowed aggregation, for now the aggregator
            // counts per file.
            continue;
        }
        mapping.insert(Yaml::from(key), sanitise_block(value)?);
    }
    mapping.insert("condition".into(), Yaml::from(condition));
    // Sigma text matching is case insensitive.
    let detection = tau::parse_detection(&Yaml::Mapping(mapping), true)?;

    let level = match level.as_deref() {
        Some("critical") => Level::Critical,
        Some("high") => Level::High,
        Some("medium") => Level::Medium,
        Some("low") => Level::Low,
        _ => Level::Info,
    };
    let status = match header.status.as_deref() {
        Some("stable") => Status::Stable,
        _ => Status::Experimental,
    };
    let authors = match &header.author {
        Some(author) => author.split(',').map(|a| a.trim().to_owned()).collect(),
        None => vec!["unknown".to_owned()],
    };

    Ok(Rule {
        name: header.title.clone(),
        detection,
        aggregate,
        authors,
        description: header.description.clone(),
        level,
        status,
        falsepositives: header.falsepositives.clone(),
        id: header.id.clone(),
        logsource: header.logsource.clone(),
        references: header.references.clone(),
        tags: header.tags.clone(),
    })
}

pub fn load(rule: &Path) -> Result<Vec<Rule>> {
    let contents = fs::read_to_string(rule)?;
    load_str(&contents)
}

fn load_str(contents: &str) -> Result<Vec<Rule>> {
    let regex = Regex::new(r"---\s*\n").expect("invalid regex");

    let mut sigma: Vec<Sigma> = vec![];
    for part in regex.split(contents) {
        let blank = part
            .lines()
            .all(|l| l.trim().is_empty() || l.trim_start().starts_with('#'));
        if blank {
            continue;
        }
        let doc = serde_yaml::from_str::<Sigma>(part)
            .map_err(|e| anyhow!("failed to parse sigma rule - {}", e))?;
        sigma.push(doc);
    }
    if sigma.is_empty() {
        anyhow::bail!("failed to parse sigma rule");
    }

    let main = sigma.remove(0);
    let header = match main.header.clone() {
        Some(header) => header,
        None => anyhow::bail!("failed to parse sigma rule"),
    };

    let mut rules = vec![];

    // Sigma rule collections share the first document's metadata across the
    // rest, with identifier blocks merged per document.
    // https://github.com/SigmaHQ/sigma/wiki/Specification#rule-collections
    let mut single = false;
    if header.action.is_some() {
        for doc in sigma.into_iter() {
            if let Some(extension) = doc.detection {
                let rule = match &main.detection {
                    Some(base) => as_rule(&header, &main.level, base.clone(), Some(extension))?,
                    None => as_rule(&header, &main.level, extension, None)?,
                };
                rules.push(rule);
            } else {
                single = true;
            }
        }
    } else {
        single = true;
    }

    if single {
        if let Some(detection) = main.detection {
            rules.push(as_rule(&header, &main.level, detection, None)?);
        }
    }

    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tau::{BoolOp, Document, Expression, Match, optimiser, solve};

    #[test]
    fn load_simple_rule() {
        let rules = load_str(
            r#"
            title: Network Logon
            description: Detects network logons
            author: one, two
            status: stable
            level: high
            detection:
                selection:
                    EventID: 4624
                    LogonType: 3
                condition: selection
            "#,
        )
        .unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.name, "Network Logon");
        assert_eq!(rule.authors, vec!["one".to_owned(), "two".to_owned()]);
        assert_eq!(rule.level, Level::High);
        assert_eq!(rule.status, Status::Stable);
        assert_eq!(
            rule.detection.expression,
            Expression::Identifier("selection".to_owned())
        );
    }

    #[test]
    fn sigma_matching_is_insensitive() {
        let rules = load_str(
            r#"
            title: Mimikatz
            description: Commandline mentions mimikatz
            detection:
                selection:
                    CommandLine|contains: MimiKatz
                condition: selection
            "#,
        )
        .unwrap();
        let detection = &rules[0].detection;
        let expression =
            optimiser::coalesce(detection.expression.clone(), &detection.identifiers);
        let document: crate::value::Value =
            serde_json::from_str(r#"{"CommandLine": "run MIMIKATZ now"}"#).unwrap();
        assert!(solve(&expression, &document as &dyn Document));
    }

    #[test]
    fn load_collection() {
        let rules = load_str(
            r#"
            title: Suspicious Service
            description: Service installs of interest
            action: global
            level: medium
            detection:
                selection:
                    EventID: 7045
            ---
            detection:
                service:
                    ServiceName: pwned
                condition: selection and service
            ---
            detection:
                service:
                    ServiceName: owned
                condition: selection and service
            "#,
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        for rule in &rules {
            assert_eq!(rule.name, "Suspicious Service");
            assert_eq!(rule.level, Level::Medium);
            assert_eq!(rule.detection.identifiers.len(), 2);
        }
    }

    #[test]
    fn aggregates_split_from_condition() {
        let rules = load_str(
            r#"
            title: Password Spray
            description: Lots of failed logons from one source
            detection:
                selection:
                    EventID: 4625
                condition: selection | count(TargetUserName) by SubjectUserName > 10
            "#,
        )
        .unwrap();
        let aggregate = rules[0].aggregate.as_ref().unwrap();
        assert_eq!(aggregate.count, Count::GreaterThan(10));
        assert_eq!(
            aggregate.fields,
            vec!["TargetUserName".to_owned(), "SubjectUserName".to_owned()]
        );
        assert_eq!(
            rules[0].detection.expression,
            Expression::Identifier("selection".to_owned())
        );
    }

    #[test]
    fn unsupported_aggregates_fail() {
        let result = load_str(
            r#"
            title: Nope
            description: near is unsupported
            detection:
                selection:
                    EventID: 1
                condition: selection | near selection
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unsupported_modifiers_fail() {
        let result = load_str(
            r#"
            title: Nope
            description: windash is unsupported
            detection:
                selection:
                    CommandLine|windash: -enc
                condition: selection
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn keyless_identifiers_fail() {
        let result = load_str(
            r#"
            title: Nope
            description: keywords are unsupported
            detection:
                keywords:
                - mimikatz
                condition: keywords
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn base64_values_are_encoded() {
        let rules = load_str(
            r#"
            title: Encoded
            description: base64 matching
            detection:
                selection:
                    Payload|base64|contains: /bin/sh
                condition: selection
            "#,
        )
        .unwrap();
        let expression = rules[0]
            .detection
            .identifiers
            .get("selection")
            .unwrap()
            .clone();
        assert_eq!(
            expression,
            Expression::Field(
                "Payload".to_owned(),
                Match::Contains("l2jpbi9zaa==".to_owned(), true)
            )
        );
    }

    #[test]
    fn base64offset_values_expand() {
        let rules = load_str(
            r#"
            title: Encoded
            description: base64 offset matching
            detection:
                selection:
                    Payload|base64offset|contains: /bin/sh
                condition: selection
            "#,
        )
        .unwrap();
        match rules[0].detection.identifiers.get("selection").unwrap() {
            Expression::Field(field, Match::OneOf(matches)) => {
                assert_eq!(field, "Payload");
                assert_eq!(matches.len(), 3);
            }
            expression => panic!("expected a one-of match, got {:?}", expression),
        }
    }

    #[test]
    fn globs_expand_in_conditions() {
        let rules = load_str(
            r#"
            title: Globs
            description: glob conditions
            detection:
                selection0:
                    EventID: 1
                selection1:
                    EventID: 2
                condition: 1 of selection*
            "#,
        )
        .unwrap();
        assert_eq!(
            rules[0].detection.expression,
            Expression::Group(
                BoolOp::Or,
                vec![
                    Expression::Identifier("selection0".to_owned()),
                    Expression::Identifier("selection1".to_owned()),
                ]
            )
        );
    }

    #[test]
    fn empty_glob_is_a_load_error() {
        let result = load_str(
            r#"
            title: Globs
            description: glob conditions
            detection:
                selection:
                    EventID: 1
                condition: selection and 1 of filter_*
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn invalid_yaml_is_a_load_error() {
        assert!(load_str("title: [unterminated").is_err());
    }
}
