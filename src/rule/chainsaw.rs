use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::file::Kind as FileKind;

use super::{Aggregate, Filter, Level, Status};

/// A chainsaw-dialect rule: one per file, carrying its own field table so no
/// separate mapping is needed.
#[derive(Clone, Debug, Deserialize)]
pub struct Rule {
    #[serde(alias = "title")]
    pub name: String,
    pub group: String,
    pub description: String,
    pub authors: Vec<String>,

    pub kind: FileKind,
    pub level: Level,
    pub status: Status,
    pub timestamp: String,

    #[serde(default)]
    pub fields: Vec<Field>,

    pub filter: Filter,

    #[serde(default)]
    pub aggregate: Option<Aggregate>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub references: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

fn default_visible() -> bool {
    true
}

/// Maps a logical field name onto a dotted document path, optionally casting
/// the value or pulling it out of an encoded container field.
#[derive(Clone, Debug, Deserialize)]
pub struct Field {
    pub name: String,
    pub from: String,
    pub to: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub cast: Option<Cast>,
    #[serde(default)]
    pub container: Option<Container>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Cast {
    Int,
    Str,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Container {
    pub field: String,
    pub format: Format,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    Kv {
        delimiter: String,
        separator: String,
        #[serde(default)]
        trim: bool,
    },
}

pub fn load(path: &Path) -> crate::Result<Rule> {
    let contents = fs::read_to_string(path)?;
    let rule: Rule = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow!("failed to load rule - {}", e))?;
    Ok(rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tau::{Document, Expression, Match, Scalar};

    const RULE: &str = r#"
        title: Suspicious Command Line
        group: Execution
        description: Detects an encoded powershell invocation
        authors:
        - testing
        kind: evtx
        level: high
        status: stable
        timestamp: Event.System.TimeCreated

        fields:
        - name: Event ID
          from: EventID
          to: Event.System.EventID
        - name: Command Line
          from: CommandLine
          to: Event.EventData.CommandLine

        filter:
          condition: powershell
          powershell:
            CommandLine|contains: ' -enc '
    "#;

    #[test]
    fn load_rule() {
        let rule: Rule = serde_yaml::from_str(RULE).unwrap();
        assert_eq!(rule.name, "Suspicious Command Line");
        assert_eq!(rule.kind, crate::file::Kind::Evtx);
        assert_eq!(rule.level, Level::High);
        assert_eq!(rule.fields.len(), 2);
        assert!(rule.fields.iter().all(|f| f.visible));
        match rule.filter {
            Filter::Detection(detection) => {
                assert_eq!(
                    detection.expression,
                    Expression::Identifier("powershell".to_owned())
                );
            }
            Filter::Expression(_) => panic!("expected a detection filter"),
        }
    }

    #[test]
    fn load_expression_filter() {
        let rule = r#"
            title: Any Logon
            group: Accounts
            description: Flags every logon event
            authors:
            - testing
            kind: evtx
            level: info
            status: stable
            timestamp: Event.System.TimeCreated
            fields: []
            filter:
              Event.System.EventID: 4624
        "#;
        let rule: Rule = serde_yaml::from_str(rule).unwrap();
        match rule.filter {
            Filter::Expression(expression) => {
                assert_eq!(
                    expression,
                    Expression::Field(
                        "Event.System.EventID".to_owned(),
                        Match::Equal(Scalar::UInt(4624), false)
                    )
                );
            }
            Filter::Detection(_) => panic!("expected an expression filter"),
        }
    }

    #[test]
    fn solve_against_document() {
        let rule: Rule = serde_yaml::from_str(RULE).unwrap();
        let expression = match &rule.filter {
            Filter::Detection(detection) => crate::tau::optimiser::coalesce(
                detection.expression.clone(),
                &detection.identifiers,
            ),
            Filter::Expression(_) => panic!("expected a detection filter"),
        };
        let hit: crate::value::Value =
            serde_json::from_str(r#"{"CommandLine": "powershell.exe -enc aGk="}"#).unwrap();
        let miss: crate::value::Value =
            serde_json::from_str(r#"{"CommandLine": "calc.exe"}"#).unwrap();
        assert!(crate::tau::solve(&expression, &hit as &dyn Document));
        assert!(!crate::tau::solve(&expression, &miss as &dyn Document));
    }
}
