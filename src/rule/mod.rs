use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use serde::de::{self, Deserializer, Visitor};

use crate::file::Kind as FileKind;
use crate::tau::{self, Detection, Expression, optimiser};

pub use self::chainsaw::Rule as Chainsaw;
pub use self::sigma::Rule as Sigma;

pub mod chainsaw;
pub mod sigma;

#[derive(Clone, Debug)]
pub enum Rule {
    Chainsaw(Chainsaw),
    Sigma(Sigma),
}

impl Rule {
    #[inline]
    pub fn aggregate(&self) -> &Option<Aggregate> {
        match self {
            Self::Chainsaw(c) => &c.aggregate,
            Self::Sigma(s) => &s.aggregate,
        }
    }

    #[inline]
    pub fn is_kind(&self, kind: &Kind) -> bool {
        match self {
            Self::Chainsaw(_) => kind == &Kind::Chainsaw,
            Self::Sigma(_) => kind == &Kind::Sigma,
        }
    }

    #[inline]
    pub fn level(&self) -> &Level {
        match self {
            Self::Chainsaw(c) => &c.level,
            Self::Sigma(s) => &s.level,
        }
    }

    #[inline]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Chainsaw(_) => Kind::Chainsaw,
            Self::Sigma(_) => Kind::Sigma,
        }
    }

    #[inline]
    pub fn types(&self) -> &FileKind {
        match self {
            Self::Chainsaw(c) => &c.kind,
            Self::Sigma(_) => &FileKind::Unknown,
        }
    }

    #[inline]
    pub fn name(&self) -> &String {
        match self {
            Self::Chainsaw(c) => &c.name,
            Self::Sigma(s) => &s.name,
        }
    }

    #[inline]
    pub fn solve(&self, document: &dyn tau::Document) -> bool {
        match self {
            Self::Chainsaw(c) => match &c.filter {
                Filter::Detection(detection) => tau::solve(&detection.expression, document),
                Filter::Expression(expression) => tau::solve(expression, document),
            },
            Self::Sigma(s) => tau::solve(&s.detection.expression, document),
        }
    }

    #[inline]
    pub fn status(&self) -> &Status {
        match self {
            Self::Chainsaw(c) => &c.status,
            Self::Sigma(s) => &s.status,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Count {
    Equal(usize),
    GreaterThan(usize),
    GreaterThanOrEqual(usize),
    LessThan(usize),
    LessThanOrEqual(usize),
}

impl Count {
    pub fn matches(&self, len: usize) -> bool {
        match self {
            Self::Equal(n) => len == *n,
            Self::GreaterThan(n) => len > *n,
            Self::GreaterThanOrEqual(n) => len >= *n,
            Self::LessThan(n) => len < *n,
            Self::LessThanOrEqual(n) => len <= *n,
        }
    }
}

impl FromStr for Count {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (count, rest) = if let Some(rest) = s.strip_prefix(">=") {
            (Self::GreaterThanOrEqual as fn(usize) -> Self, rest)
        } else if let Some(rest) = s.strip_prefix("<=") {
            (Self::LessThanOrEqual as fn(usize) -> Self, rest)
        } else if let Some(rest) = s.strip_prefix('>') {
            (Self::GreaterThan as fn(usize) -> Self, rest)
        } else if let Some(rest) = s.strip_prefix('<') {
            (Self::LessThan as fn(usize) -> Self, rest)
        } else if let Some(rest) = s.strip_prefix("==") {
            (Self::Equal as fn(usize) -> Self, rest)
        } else {
            (Self::Equal as fn(usize) -> Self, s)
        };
        let number = rest
            .trim()
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid aggregate count '{}'", s))?;
        Ok(count(number))
    }
}

fn deserialize_count<'de, D>(deserializer: D) -> Result<Count, D::Error>
where
    D: Deserializer<'de>,
{
    struct CountVisitor;

    impl Visitor<'_> for CountVisitor {
        type Value = Count;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a count or comparison such as '>5'")
        }

        fn visit_u64<E>(self, n: u64) -> Result<Count, E> {
            Ok(Count::Equal(n as usize))
        }

        fn visit_str<E>(self, s: &str) -> Result<Count, E>
        where
            E: de::Error,
        {
            Count::from_str(s).map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_any(CountVisitor)
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct Aggregate {
    #[serde(deserialize_with = "deserialize_count")]
    pub count: Count,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Detection(Detection),
    #[serde(deserialize_with = "crate::tau::deserialize_expression")]
    Expression(Expression),
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Chainsaw,
    Sigma,
}

impl Default for Kind {
    fn default() -> Self {
        Self::Chainsaw
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chainsaw => write!(f, "chainsaw"),
            Self::Sigma => write!(f, "sigma"),
        }
    }
}

impl FromStr for Kind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = match s {
            "chainsaw" => Self::Chainsaw,
            "sigma" => Self::Sigma,
            _ => anyhow::bail!("unknown kind, must be: chainsaw, or sigma"),
        };
        Ok(v)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Critical,
    High,
    Medium,
    Low,
    #[serde(alias = "informational")]
    Info,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
            Self::Info => write!(f, "info"),
        }
    }
}

impl FromStr for Level {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = match s {
            "critical" => Self::Critical,
            "high" => Self::High,
            "medium" => Self::Medium,
            "low" => Self::Low,
            "info" | "informational" => Self::Info,
            _ => anyhow::bail!("unknown level, must be: critical, high, medium, low or info"),
        };
        Ok(v)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Stable,
    Experimental,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Experimental => write!(f, "experimental"),
        }
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = match s {
            "stable" => Self::Stable,
            "experimental" => Self::Experimental,
            _ => anyhow::bail!("unknown status, must be: stable or experimental"),
        };
        Ok(v)
    }
}

fn check_extension(path: &Path) -> crate::Result<()> {
    if let Some(extension) = path.extension() {
        let extension = extension.to_string_lossy().to_lowercase();
        if extension != "yml" && extension != "yaml" {
            anyhow::bail!("rule must have a yaml file extension");
        }
    }
    Ok(())
}

/// Runs the optimisation passes in their fixed order, emptying the
/// identifier map once it has been inlined.
fn optimise(detection: &mut Detection) {
    let expression = std::mem::take(&mut detection.expression);
    let identifiers = std::mem::take(&mut detection.identifiers);
    let expression = optimiser::coalesce(expression, &identifiers);
    let expression = optimiser::shake(expression);
    let expression = optimiser::rewrite(expression);
    detection.expression = optimiser::matrix(expression);
}

fn optimise_expression(expression: Expression) -> Expression {
    let expression = optimiser::shake(expression);
    let expression = optimiser::rewrite(expression);
    optimiser::matrix(expression)
}

/// Loads the rules in a file, optimised and ready for the hunter.
pub fn load(kind: &Kind, path: &Path) -> crate::Result<Vec<Rule>> {
    check_extension(path)?;
    let mut rules = match kind {
        Kind::Chainsaw => {
            let rule = chainsaw::load(path)?;
            vec![Rule::Chainsaw(rule)]
        }
        Kind::Sigma => sigma::load(path)?.into_iter().map(Rule::Sigma).collect(),
    };
    for rule in &mut rules {
        match rule {
            Rule::Chainsaw(c) => match &mut c.filter {
                Filter::Detection(detection) => optimise(detection),
                Filter::Expression(expression) => {
                    *expression = optimise_expression(std::mem::take(expression));
                }
            },
            Rule::Sigma(s) => optimise(&mut s.detection),
        }
    }
    Ok(rules)
}

/// Loads the filters in a rule file without optimisation, for the linter.
pub fn lint(kind: &Kind, path: &Path) -> crate::Result<Vec<Filter>> {
    check_extension(path)?;
    let filters = match kind {
        Kind::Chainsaw => {
            let rule = chainsaw::load(path)?;
            vec![rule.filter]
        }
        Kind::Sigma => sigma::load(path)?
            .into_iter()
            .map(|rule| Filter::Detection(rule.detection))
            .collect(),
    };
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_parsing() {
        assert_eq!(Count::from_str("5").unwrap(), Count::Equal(5));
        assert_eq!(Count::from_str(">5").unwrap(), Count::GreaterThan(5));
        assert_eq!(Count::from_str(">= 5").unwrap(), Count::GreaterThanOrEqual(5));
        assert_eq!(Count::from_str("<5").unwrap(), Count::LessThan(5));
        assert_eq!(Count::from_str("<=5").unwrap(), Count::LessThanOrEqual(5));
        assert!(Count::from_str("~5").is_err());
    }

    #[test]
    fn count_matching() {
        assert!(Count::GreaterThan(2).matches(3));
        assert!(!Count::GreaterThan(2).matches(2));
        assert!(Count::Equal(2).matches(2));
        assert!(Count::LessThanOrEqual(2).matches(2));
    }
}
