use std::collections::{BTreeMap, HashSet};
use std::fmt;

use aho_corasick::AhoCorasick;
use regex::Regex;
use serde::de::{self, Deserialize, Deserializer};
use serde_yaml::{Mapping, Value as Yaml};

lazy_static::lazy_static! {
    static ref SUPPORTED_MODIFIERS: HashSet<&'static str> = {
        let mut set = HashSet::new();
        set.insert("i");
        set.insert("all");
        set.insert("contains");
        set.insert("endswith");
        set.insert("startswith");
        set.insert("re");
        set.insert("gt");
        set.insert("gte");
        set.insert("lt");
        set.insert("lte");
        set
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

/// The tau expression tree. Rule loaders build it, the optimiser reshapes it
/// and the solver walks it; nothing else is allowed to interpret rules.
#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    Boolean(bool),
    Cast(String),
    Field(String, Match),
    Group(BoolOp, Vec<Expression>),
    Identifier(String),
    Missing(String),
    Negate(Box<Expression>),
    Nested(String, Box<Expression>),
    Null(String),
    Search(MatchKind, bool),
}

impl Default for Expression {
    fn default() -> Self {
        Self::Boolean(false)
    }
}

#[derive(Clone, Debug)]
pub enum MatchKind {
    Exact(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Regex(Box<Regex>),
}

impl PartialEq for MatchKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(x), Self::Exact(y)) => x == y,
            (Self::Contains(x), Self::Contains(y)) => x == y,
            (Self::StartsWith(x), Self::StartsWith(y)) => x == y,
            (Self::EndsWith(x), Self::EndsWith(y)) => x == y,
            (Self::Regex(x), Self::Regex(y)) => x.as_str() == y.as_str(),
            (_, _) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
}

/// A field-value predicate. Text predicates carry their case-folding flag;
/// folded needles are lowercased at parse time so the solver only folds the
/// document side.
#[derive(Clone, Debug)]
pub enum Match {
    AllOf(Vec<Match>),
    OneOf(Vec<Match>),
    Equal(Scalar, bool),
    Contains(String, bool),
    StartsWith(String, bool),
    EndsWith(String, bool),
    Regex(Box<Regex>),
    GreaterThan(Number),
    GreaterThanOrEqual(Number),
    LessThan(Number),
    LessThanOrEqual(Number),
    In(Vec<Scalar>, bool),
    Fused(Fused),
}

impl PartialEq for Match {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::AllOf(x), Self::AllOf(y)) => x == y,
            (Self::OneOf(x), Self::OneOf(y)) => x == y,
            (Self::Equal(x, fx), Self::Equal(y, fy)) => x == y && fx == fy,
            (Self::Contains(x, fx), Self::Contains(y, fy)) => x == y && fx == fy,
            (Self::StartsWith(x, fx), Self::StartsWith(y, fy)) => x == y && fx == fy,
            (Self::EndsWith(x, fx), Self::EndsWith(y, fy)) => x == y && fx == fy,
            (Self::Regex(x), Self::Regex(y)) => x.as_str() == y.as_str(),
            (Self::GreaterThan(x), Self::GreaterThan(y)) => x == y,
            (Self::GreaterThanOrEqual(x), Self::GreaterThanOrEqual(y)) => x == y,
            (Self::LessThan(x), Self::LessThan(y)) => x == y,
            (Self::LessThanOrEqual(x), Self::LessThanOrEqual(y)) => x == y,
            (Self::In(x, fx), Self::In(y, fy)) => x == y && fx == fy,
            (Self::Fused(x), Self::Fused(y)) => x == y,
            (_, _) => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Anchor {
    Exact,
    Contains,
    StartsWith,
    EndsWith,
}

/// A multi-pattern text matcher built by the `matrix` pass: one aho-corasick
/// automaton over all needles, each hit checked against its anchor.
#[derive(Clone, Debug)]
pub struct Fused {
    automaton: AhoCorasick,
    patterns: Vec<(Anchor, String)>,
    fold: bool,
    all: bool,
}

impl PartialEq for Fused {
    fn eq(&self, other: &Self) -> bool {
        self.patterns == other.patterns && self.fold == other.fold && self.all == other.all
    }
}

impl Fused {
    pub(crate) fn new(patterns: Vec<(Anchor, String)>, fold: bool, all: bool) -> Option<Self> {
        let automaton = AhoCorasick::new(patterns.iter().map(|(_, needle)| needle.as_str())).ok()?;
        Some(Self {
            automaton,
            patterns,
            fold,
            all,
        })
    }

    pub fn patterns(&self) -> &[(Anchor, String)] {
        &self.patterns
    }

    pub fn fold(&self) -> bool {
        self.fold
    }

    pub fn all(&self) -> bool {
        self.all
    }

    /// Matches across a sequence of values: with `all` set every pattern
    /// must hit somewhere in the sequence, mirroring how an unfused
    /// conjunction treats array fields.
    pub fn matches_seq<I>(&self, values: I) -> bool
    where
        I: Iterator<Item = String>,
    {
        let mut hits = vec![false; self.patterns.len()];
        for value in values {
            let folded;
            let haystack = if self.fold {
                folded = value.to_lowercase();
                folded.as_str()
            } else {
                value.as_str()
            };
            for hit in self.automaton.find_overlapping_iter(haystack) {
                let index = hit.pattern().as_usize();
                let anchored = match self.patterns[index].0 {
                    Anchor::Contains => true,
                    Anchor::StartsWith => hit.start() == 0,
                    Anchor::EndsWith => hit.end() == haystack.len(),
                    Anchor::Exact => hit.start() == 0 && hit.end() == haystack.len(),
                };
                if !anchored {
                    continue;
                }
                if !self.all {
                    return true;
                }
                hits[index] = true;
            }
            if self.all && hits.iter().all(|h| *h) {
                return true;
            }
        }
        false
    }

    pub fn matches(&self, value: &str) -> bool {
        let folded;
        let haystack = if self.fold {
            folded = value.to_lowercase();
            folded.as_str()
        } else {
            value
        };
        let mut hits = vec![false; self.patterns.len()];
        for hit in self.automaton.find_overlapping_iter(haystack) {
            let index = hit.pattern().as_usize();
            let anchored = match self.patterns[index].0 {
                Anchor::Contains => true,
                Anchor::StartsWith => hit.start() == 0,
                Anchor::EndsWith => hit.end() == haystack.len(),
                Anchor::Exact => hit.start() == 0 && hit.end() == haystack.len(),
            };
            if !anchored {
                continue;
            }
            if !self.all {
                return true;
            }
            hits[index] = true;
            if hits.iter().all(|h| *h) {
                return true;
            }
        }
        false
    }
}

/// A parsed detection: the condition expression plus the identifier bodies it
/// references. The `coalesce` pass inlines the identifiers and empties the
/// map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Detection {
    pub expression: Expression,
    pub identifiers: BTreeMap<String, Expression>,
}

impl<'de> Deserialize<'de> for Detection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let yaml: Yaml = Deserialize::deserialize(deserializer)?;
        parse_detection(&yaml, false).map_err(de::Error::custom)
    }
}

struct Modifiers {
    all: bool,
    fold: bool,
    comparator: Option<fn(Number) -> Match>,
    kind: Option<&'static str>,
    regex: bool,
}

fn parse_modifiers(key: &str, insensitive: bool) -> crate::Result<(String, Modifiers)> {
    let mut parts = key.split('|');
    let field = parts
        .next()
        .expect("split always yields one part")
        .to_owned();
    if field.is_empty() {
        anyhow::bail!("empty field name in '{}'", key);
    }
    let mut modifiers = Modifiers {
        all: false,
        fold: insensitive,
        comparator: None,
        kind: None,
        regex: false,
    };
    for modifier in parts {
        if !SUPPORTED_MODIFIERS.contains(modifier) {
            anyhow::bail!("unknown modifier '{}'", modifier);
        }
        match modifier {
            "i" => modifiers.fold = true,
            "all" => modifiers.all = true,
            "re" => modifiers.regex = true,
            "contains" | "startswith" | "endswith" => {
                if modifiers.kind.is_some() {
                    anyhow::bail!("conflicting modifiers in '{}'", key);
                }
                modifiers.kind = match modifier {
                    "contains" => Some("contains"),
                    "startswith" => Some("startswith"),
                    _ => Some("endswith"),
                };
            }
            "gt" => modifiers.comparator = Some(Match::GreaterThan),
            "gte" => modifiers.comparator = Some(Match::GreaterThanOrEqual),
            "lt" => modifiers.comparator = Some(Match::LessThan),
            "lte" => modifiers.comparator = Some(Match::LessThanOrEqual),
            _ => unreachable!(),
        }
    }
    Ok((field, modifiers))
}

fn fold(text: &str, fold: bool) -> String {
    if fold {
        text.to_lowercase()
    } else {
        text.to_owned()
    }
}

/// Converts a pattern with inner wildcards into an anchored regex, `*` as any
/// run and `?` as any single character.
fn wildcard_to_regex(pattern: &str, insensitive: bool) -> crate::Result<Regex> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    if insensitive {
        translated.push_str("(?i)");
    }
    translated.push('^');
    for c in pattern.chars() {
        match c {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            c => translated.push_str(&regex::escape(&c.to_string())),
        }
    }
    translated.push('$');
    Regex::new(&translated).map_err(|e| anyhow!("invalid wildcard pattern '{}' - {}", pattern, e))
}

fn string_to_match(value: &str, modifiers: &Modifiers) -> crate::Result<Match> {
    if modifiers.regex {
        let regex =
            Regex::new(value).map_err(|e| anyhow!("invalid regex '{}' - {}", value, e))?;
        return Ok(Match::Regex(Box::new(regex)));
    }
    if let Some(comparator) = modifiers.comparator {
        let number = if let Ok(i) = value.parse::<i64>() {
            Number::Int(i)
        } else if let Ok(f) = value.parse::<f64>() {
            Number::Float(f)
        } else {
            anyhow::bail!("comparator modifiers require a numeric value, got '{}'", value);
        };
        return Ok(comparator(number));
    }
    match modifiers.kind {
        Some("contains") => return Ok(Match::Contains(fold(value, modifiers.fold), modifiers.fold)),
        Some("startswith") => {
            return Ok(Match::StartsWith(fold(value, modifiers.fold), modifiers.fold));
        }
        Some("endswith") => return Ok(Match::EndsWith(fold(value, modifiers.fold), modifiers.fold)),
        _ => {}
    }
    // Bare strings get the wildcard treatment: anchoring stars pick the text
    // kind, inner wildcards force a regex.
    let starts = value.starts_with('*');
    let ends = value.len() > 1 && value.ends_with('*') && !value.ends_with("\\*");
    let inner = {
        let from = if starts { 1 } else { 0 };
        let to = if ends { value.len() - 1 } else { value.len() };
        &value[from..to]
    };
    if inner.contains('*') || inner.contains('?') {
        return Ok(Match::Regex(Box::new(wildcard_to_regex(value, modifiers.fold)?)));
    }
    let needle = fold(inner, modifiers.fold);
    let matcher = match (starts, ends) {
        (true, true) => Match::Contains(needle, modifiers.fold),
        (true, false) => Match::EndsWith(needle, modifiers.fold),
        (false, true) => Match::StartsWith(needle, modifiers.fold),
        (false, false) => Match::Equal(Scalar::String(needle), modifiers.fold),
    };
    Ok(matcher)
}

fn number_to_scalar(number: &serde_yaml::Number) -> crate::Result<Scalar> {
    if let Some(u) = number.as_u64() {
        Ok(Scalar::UInt(u))
    } else if let Some(i) = number.as_i64() {
        Ok(Scalar::Int(i))
    } else if let Some(f) = number.as_f64() {
        Ok(Scalar::Float(f))
    } else {
        anyhow::bail!("unsupported number '{}'", number)
    }
}

fn scalar_to_match(value: &Yaml, modifiers: &Modifiers) -> crate::Result<Match> {
    match value {
        Yaml::Null => Ok(Match::Equal(Scalar::Null, false)),
        Yaml::Bool(b) => Ok(Match::Equal(Scalar::Bool(*b), false)),
        Yaml::Number(n) => {
            let scalar = number_to_scalar(n)?;
            if let Some(comparator) = modifiers.comparator {
                let number = match scalar {
                    Scalar::UInt(u) => i64::try_from(u)
                        .map(Number::Int)
                        .unwrap_or(Number::Float(u as f64)),
                    Scalar::Int(i) => Number::Int(i),
                    Scalar::Float(f) => Number::Float(f),
                    _ => unreachable!(),
                };
                return Ok(comparator(number));
            }
            Ok(Match::Equal(scalar, false))
        }
        Yaml::String(s) => string_to_match(s, modifiers),
        _ => anyhow::bail!("match values must be scalars"),
    }
}

fn field_to_expression(key: &str, value: &Yaml, insensitive: bool) -> crate::Result<Expression> {
    let (field, modifiers) = parse_modifiers(key, insensitive)?;
    let expression = match value {
        // A null value is a presence predicate: absent, or present and null.
        Yaml::Null => Expression::Group(
            BoolOp::Or,
            vec![
                Expression::Missing(field.clone()),
                Expression::Null(field),
            ],
        ),
        Yaml::Bool(_) | Yaml::Number(_) | Yaml::String(_) => {
            Expression::Field(field, scalar_to_match(value, &modifiers)?)
        }
        Yaml::Sequence(sequence) => {
            if sequence.iter().all(|v| v.as_mapping().is_some()) && !sequence.is_empty() {
                let mut blocks = Vec::with_capacity(sequence.len());
                for entry in sequence {
                    blocks.push(mapping_to_expression(
                        entry.as_mapping().expect("checked above"),
                        insensitive,
                    )?);
                }
                Expression::Nested(field, Box::new(Expression::Group(BoolOp::Or, blocks)))
            } else {
                let mut matches = Vec::with_capacity(sequence.len());
                for entry in sequence {
                    matches.push(scalar_to_match(entry, &modifiers)?);
                }
                let matcher = if modifiers.all {
                    Match::AllOf(matches)
                } else {
                    Match::OneOf(matches)
                };
                Expression::Field(field, matcher)
            }
        }
        Yaml::Mapping(mapping) => Expression::Nested(
            field,
            Box::new(mapping_to_expression(mapping, insensitive)?),
        ),
        Yaml::Tagged(_) => anyhow::bail!("tagged values are not supported"),
    };
    Ok(expression)
}

fn mapping_to_expression(mapping: &Mapping, insensitive: bool) -> crate::Result<Expression> {
    let mut expressions = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| anyhow!("field names must be strings"))?;
        expressions.push(field_to_expression(key, value, insensitive)?);
    }
    if expressions.len() == 1 {
        Ok(expressions.remove(0))
    } else {
        Ok(Expression::Group(BoolOp::And, expressions))
    }
}

fn search_to_expression(value: &Yaml, insensitive: bool) -> crate::Result<Expression> {
    let text = match value {
        Yaml::String(s) => s.clone(),
        Yaml::Number(n) => n.to_string(),
        Yaml::Bool(b) => b.to_string(),
        _ => anyhow::bail!("search values must be scalars"),
    };
    let starts = text.starts_with('*');
    let ends = text.len() > 1 && text.ends_with('*');
    let inner = &text[if starts { 1 } else { 0 }..if ends { text.len() - 1 } else { text.len() }];
    if inner.contains('*') || inner.contains('?') {
        let regex = wildcard_to_regex(&text, insensitive)?;
        return Ok(Expression::Search(MatchKind::Regex(Box::new(regex)), false));
    }
    let needle = fold(inner, insensitive);
    let kind = match (starts, ends) {
        (false, false) => MatchKind::Contains(needle),
        (true, true) => MatchKind::Contains(needle),
        (true, false) => MatchKind::EndsWith(needle),
        (false, true) => MatchKind::StartsWith(needle),
    };
    Ok(Expression::Search(kind, insensitive))
}

/// Parses one identifier block: a mapping is a conjunction of its fields, a
/// sequence of mappings is a disjunction of blocks, and bare scalars are
/// whole-document searches.
pub(crate) fn block_to_expression(yaml: &Yaml, insensitive: bool) -> crate::Result<Expression> {
    match yaml {
        Yaml::Mapping(mapping) => mapping_to_expression(mapping, insensitive),
        Yaml::Sequence(sequence) => {
            if sequence.is_empty() {
                anyhow::bail!("identifier blocks cannot be empty");
            }
            let mut expressions = Vec::with_capacity(sequence.len());
            if sequence.iter().all(|v| v.as_mapping().is_some()) {
                for entry in sequence {
                    expressions.push(mapping_to_expression(
                        entry.as_mapping().expect("checked above"),
                        insensitive,
                    )?);
                }
            } else if sequence.iter().all(|v| v.as_mapping().is_none()) {
                for entry in sequence {
                    expressions.push(search_to_expression(entry, insensitive)?);
                }
            } else {
                anyhow::bail!("identifier blocks cannot mix mappings and scalars");
            }
            if expressions.len() == 1 {
                Ok(expressions.remove(0))
            } else {
                Ok(Expression::Group(BoolOp::Or, expressions))
            }
        }
        Yaml::String(_) => search_to_expression(yaml, insensitive),
        _ => anyhow::bail!("identifier blocks must be a mapping or a sequence"),
    }
}

/// Parses a bare expression node (a mapping of field predicates), the form
/// used by mapping group filters and the chainsaw `filter:` shorthand.
pub fn parse_expression(yaml: &Yaml, insensitive: bool) -> crate::Result<Expression> {
    if let Yaml::Mapping(mapping) = yaml {
        // A stray condition means a detection that failed to parse, not a
        // predicate on a field called condition.
        if mapping.get("condition").is_some() {
            anyhow::bail!("expressions cannot contain a condition");
        }
    }
    block_to_expression(yaml, insensitive)
}

/// Parses a Sigma-style detection node: keyed identifier blocks plus a
/// `condition` string.
pub fn parse_detection(yaml: &Yaml, insensitive: bool) -> crate::Result<Detection> {
    let mapping = match yaml {
        Yaml::Mapping(mapping) => mapping,
        _ => anyhow::bail!("detections must be a mapping"),
    };
    let mut condition = None;
    let mut identifiers = BTreeMap::new();
    let mut order = vec![];
    for (key, value) in mapping {
        let key = key
            .as_str()
            .ok_or_else(|| anyhow!("identifiers must be strings"))?;
        if key == "condition" {
            condition = Some(match value {
                Yaml::String(s) => s.clone(),
                _ => anyhow::bail!("condition must be a string"),
            });
            continue;
        }
        let expression = block_to_expression(value, insensitive)?;
        if identifiers.insert(key.to_owned(), expression).is_some() {
            anyhow::bail!("duplicate identifier '{}'", key);
        }
        order.push(key.to_owned());
    }
    let condition = condition.ok_or_else(|| anyhow!("missing condition"))?;
    if condition.contains('|') {
        anyhow::bail!("unsupported condition - {}", condition);
    }
    let expression = parse_condition(&condition, &order)?;
    Ok(Detection {
        expression,
        identifiers,
    })
}

/// Parses a single `key: value` (or `key|modifier: value`) pair, the form
/// taken by `search -t`.
pub fn parse_kv(kv: &str) -> crate::Result<Expression> {
    let (key, value) = kv
        .split_once(": ")
        .ok_or_else(|| anyhow!("invalid tau key value pair '{}'", kv))?;
    let yaml = if value == "null" {
        Yaml::Null
    } else if let Ok(i) = value.parse::<i64>() {
        Yaml::from(i)
    } else if let Ok(u) = value.parse::<u64>() {
        Yaml::from(u)
    } else if let Ok(f) = value.parse::<f64>() {
        Yaml::from(f)
    } else if let Ok(b) = value.parse::<bool>() {
        Yaml::from(b)
    } else {
        Yaml::from(value)
    };
    field_to_expression(key, &yaml, false)
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Open,
    Close,
    Word(String),
}

fn tokenise(condition: &str) -> Vec<Token> {
    let mut tokens = vec![];
    let mut word = String::new();
    for c in condition.chars() {
        match c {
            '(' | ')' => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
                tokens.push(if c == '(' { Token::Open } else { Token::Close });
            }
            c if c.is_whitespace() => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
            }
            c => word.push(c),
        }
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    tokens
}

struct ConditionParser<'a> {
    tokens: Vec<Token>,
    position: usize,
    identifiers: &'a [String],
}

impl ConditionParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn parse_or(&mut self) -> crate::Result<Expression> {
        let mut expressions = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::Word(w)) if w == "or") {
            self.next();
            expressions.push(self.parse_and()?);
        }
        if expressions.len() == 1 {
            Ok(expressions.remove(0))
        } else {
            Ok(Expression::Group(BoolOp::Or, expressions))
        }
    }

    fn parse_and(&mut self) -> crate::Result<Expression> {
        let mut expressions = vec![self.parse_not()?];
        while matches!(self.peek(), Some(Token::Word(w)) if w == "and") {
            self.next();
            expressions.push(self.parse_not()?);
        }
        if expressions.len() == 1 {
            Ok(expressions.remove(0))
        } else {
            Ok(Expression::Group(BoolOp::And, expressions))
        }
    }

    fn parse_not(&mut self) -> crate::Result<Expression> {
        if matches!(self.peek(), Some(Token::Word(w)) if w == "not") {
            self.next();
            return Ok(Expression::Negate(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> crate::Result<Expression> {
        match self.next() {
            Some(Token::Open) => {
                let expression = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(expression),
                    _ => anyhow::bail!("unbalanced parenthesis in condition"),
                }
            }
            Some(Token::Word(word)) => {
                match word.as_str() {
                    "all" | "1" => {
                        match self.next() {
                            Some(Token::Word(of)) if of == "of" => {}
                            _ => anyhow::bail!("expected 'of' after '{}'", word),
                        }
                        let target = match self.next() {
                            Some(Token::Word(target)) => target.clone(),
                            _ => anyhow::bail!("expected an identifier pattern after 'of'"),
                        };
                        let op = if word == "all" { BoolOp::And } else { BoolOp::Or };
                        self.expand(op, &target)
                    }
                    "and" | "or" | "not" | "of" | "them" => {
                        anyhow::bail!("unsupported condition - unexpected '{}'", word)
                    }
                    _ => self.identifier(&word),
                }
            }
            Some(Token::Close) | None => anyhow::bail!("unsupported condition - truncated"),
        }
    }

    fn identifier(&self, name: &str) -> crate::Result<Expression> {
        if !self.identifiers.iter().any(|i| i == name) {
            anyhow::bail!("unknown identifier '{}'", name);
        }
        Ok(Expression::Identifier(name.to_owned()))
    }

    /// Expands `1 of X`/`all of X` at parse time: `them` covers every
    /// identifier, a `*` pattern every matching one. No match is an error.
    fn expand(&self, op: BoolOp, target: &str) -> crate::Result<Expression> {
        let matched: Vec<&String> = if target == "them" {
            self.identifiers.iter().collect()
        } else if target.contains('*') {
            self.identifiers
                .iter()
                .filter(|i| glob_match(target, i))
                .collect()
        } else {
            self.identifiers.iter().filter(|i| *i == target).collect()
        };
        if matched.is_empty() {
            anyhow::bail!("could not find any applicable identifiers for '{}'", target);
        }
        let mut expressions = matched
            .into_iter()
            .map(|i| Expression::Identifier(i.clone()))
            .collect::<Vec<_>>();
        if expressions.len() == 1 {
            Ok(expressions.remove(0))
        } else {
            Ok(Expression::Group(op, expressions))
        }
    }
}

fn glob_match(pattern: &str, name: &str) -> bool {
    let mut remainder = name;
    let mut segments = pattern.split('*');
    if let Some(first) = segments.next() {
        match remainder.strip_prefix(first) {
            Some(rest) => remainder = rest,
            None => return false,
        }
    }
    let mut last = None;
    for segment in segments {
        last = Some(segment);
        if segment.is_empty() {
            continue;
        }
        match remainder.find(segment) {
            Some(at) => remainder = &remainder[at + segment.len()..],
            None => return false,
        }
    }
    match last {
        // The pattern did not end with '*': the final segment must anchor.
        Some(segment) if !segment.is_empty() => name.ends_with(segment),
        _ => true,
    }
}

fn parse_condition(condition: &str, identifiers: &[String]) -> crate::Result<Expression> {
    let mut parser = ConditionParser {
        tokens: tokenise(condition),
        position: 0,
        identifiers,
    };
    let expression = parser.parse_or()?;
    if parser.peek().is_some() {
        anyhow::bail!("unsupported condition - {}", condition);
    }
    Ok(expression)
}

impl Scalar {
    fn to_yaml(&self) -> Yaml {
        match self {
            Self::Null => Yaml::Null,
            Self::Bool(b) => Yaml::from(*b),
            Self::Int(i) => Yaml::from(*i),
            Self::UInt(u) => Yaml::from(*u),
            Self::Float(f) => Yaml::from(*f),
            Self::String(s) => Yaml::from(s.as_str()),
        }
    }
}

impl Match {
    fn to_yaml(&self) -> Yaml {
        fn text(kind: &str, needle: &str, fold: bool) -> Yaml {
            if fold {
                Yaml::from(format!("i{}({})", kind, needle))
            } else {
                Yaml::from(format!("{}({})", kind, needle))
            }
        }
        match self {
            Self::AllOf(matches) => {
                let mut mapping = Mapping::new();
                mapping.insert(
                    "all".into(),
                    Yaml::Sequence(matches.iter().map(|m| m.to_yaml()).collect()),
                );
                Yaml::Mapping(mapping)
            }
            Self::OneOf(matches) => {
                Yaml::Sequence(matches.iter().map(|m| m.to_yaml()).collect())
            }
            Self::Equal(scalar, fold) => match scalar {
                Scalar::String(s) if *fold => Yaml::from(format!("i({})", s)),
                scalar => scalar.to_yaml(),
            },
            Self::Contains(s, fold) => text("contains", s, *fold),
            Self::StartsWith(s, fold) => text("startswith", s, *fold),
            Self::EndsWith(s, fold) => text("endswith", s, *fold),
            Self::Regex(regex) => Yaml::from(format!("regex({})", regex.as_str())),
            Self::GreaterThan(n) => Yaml::from(format!(">{}", n)),
            Self::GreaterThanOrEqual(n) => Yaml::from(format!(">={}", n)),
            Self::LessThan(n) => Yaml::from(format!("<{}", n)),
            Self::LessThanOrEqual(n) => Yaml::from(format!("<={}", n)),
            Self::In(scalars, _) => {
                Yaml::Sequence(scalars.iter().map(|s| s.to_yaml()).collect())
            }
            Self::Fused(fused) => {
                let patterns: Vec<Yaml> = fused
                    .patterns()
                    .iter()
                    .map(|(anchor, needle)| {
                        let kind = match anchor {
                            Anchor::Exact => "exact",
                            Anchor::Contains => "contains",
                            Anchor::StartsWith => "startswith",
                            Anchor::EndsWith => "endswith",
                        };
                        text(kind, needle, fused.fold())
                    })
                    .collect();
                if fused.all() {
                    let mut mapping = Mapping::new();
                    mapping.insert("all".into(), Yaml::Sequence(patterns));
                    Yaml::Mapping(mapping)
                } else {
                    Yaml::Sequence(patterns)
                }
            }
        }
    }
}

impl Expression {
    /// A YAML rendering of the expression, used by `lint --tau`.
    pub fn to_yaml(&self) -> Yaml {
        fn entry(key: &str, value: Yaml) -> Yaml {
            let mut mapping = Mapping::new();
            mapping.insert(key.into(), value);
            Yaml::Mapping(mapping)
        }
        match self {
            Self::Boolean(b) => Yaml::from(*b),
            Self::Cast(field) => entry("cast", Yaml::from(field.as_str())),
            Self::Field(field, matcher) => entry(field, matcher.to_yaml()),
            Self::Group(BoolOp::And, expressions) => entry(
                "and",
                Yaml::Sequence(expressions.iter().map(|e| e.to_yaml()).collect()),
            ),
            Self::Group(BoolOp::Or, expressions) => entry(
                "or",
                Yaml::Sequence(expressions.iter().map(|e| e.to_yaml()).collect()),
            ),
            Self::Identifier(name) => entry("identifier", Yaml::from(name.as_str())),
            Self::Missing(field) => entry("missing", Yaml::from(field.as_str())),
            Self::Negate(expression) => entry("not", expression.to_yaml()),
            Self::Nested(field, expression) => {
                entry(&format!("nested({})", field), expression.to_yaml())
            }
            Self::Null(field) => entry("null", Yaml::from(field.as_str())),
            Self::Search(kind, fold) => {
                let rendered = match kind {
                    MatchKind::Exact(s) => format!("exact({})", s),
                    MatchKind::Contains(s) => format!("contains({})", s),
                    MatchKind::StartsWith(s) => format!("startswith({})", s),
                    MatchKind::EndsWith(s) => format!("endswith({})", s),
                    MatchKind::Regex(r) => format!("regex({})", r.as_str()),
                };
                let rendered = if *fold {
                    format!("i{}", rendered)
                } else {
                    rendered
                };
                entry("search", Yaml::from(rendered))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Yaml {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn parse_simple_detection() {
        let detection = parse_detection(
            &yaml(
                r#"
                A:
                    EventID: 4624
                condition: A
                "#,
            ),
            false,
        )
        .unwrap();
        assert_eq!(detection.expression, Expression::Identifier("A".to_owned()));
        assert_eq!(
            detection.identifiers.get("A"),
            Some(&Expression::Field(
                "EventID".to_owned(),
                Match::Equal(Scalar::UInt(4624), false)
            ))
        );
    }

    #[test]
    fn parse_condition_precedence() {
        let detection = parse_detection(
            &yaml(
                r#"
                A:
                    x: 1
                B:
                    y: 2
                C:
                    z: 3
                condition: A or B and not C
                "#,
            ),
            false,
        )
        .unwrap();
        assert_eq!(
            detection.expression,
            Expression::Group(
                BoolOp::Or,
                vec![
                    Expression::Identifier("A".to_owned()),
                    Expression::Group(
                        BoolOp::And,
                        vec![
                            Expression::Identifier("B".to_owned()),
                            Expression::Negate(Box::new(Expression::Identifier("C".to_owned()))),
                        ]
                    ),
                ]
            )
        );
    }

    #[test]
    fn parse_condition_globs() {
        let detection = parse_detection(
            &yaml(
                r#"
                selection0:
                    x: 1
                selection1:
                    y: 2
                filter:
                    z: 3
                condition: 1 of selection* and not all of them
                "#,
            ),
            false,
        )
        .unwrap();
        assert_eq!(
            detection.expression,
            Expression::Group(
                BoolOp::And,
                vec![
                    Expression::Group(
                        BoolOp::Or,
                        vec![
                            Expression::Identifier("selection0".to_owned()),
                            Expression::Identifier("selection1".to_owned()),
                        ]
                    ),
                    Expression::Negate(Box::new(Expression::Group(
                        BoolOp::And,
                        vec![
                            Expression::Identifier("selection0".to_owned()),
                            Expression::Identifier("selection1".to_owned()),
                            Expression::Identifier("filter".to_owned()),
                        ]
                    ))),
                ]
            )
        );
    }

    #[test]
    fn parse_condition_empty_glob_fails() {
        let result = parse_detection(
            &yaml(
                r#"
                selection:
                    x: 1
                condition: selection and 1 of filter_*
                "#,
            ),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_condition_unknown_identifier_fails() {
        let result = parse_detection(
            &yaml(
                r#"
                A:
                    x: 1
                condition: A and B
                "#,
            ),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_condition_aggregates_rejected() {
        let result = parse_detection(
            &yaml(
                r#"
                A:
                    x: 1
                condition: A | count() > 5
                "#,
            ),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_unknown_modifier_fails() {
        let result = parse_detection(
            &yaml(
                r#"
                A:
                    x|b64: 1
                condition: A
                "#,
            ),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_bad_regex_fails() {
        let result = parse_detection(
            &yaml(
                r#"
                A:
                    x|re: "["
                condition: A
                "#,
            ),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_wildcards() {
        let expression = parse_kv("CommandLine: *mimikatz*").unwrap();
        assert_eq!(
            expression,
            Expression::Field(
                "CommandLine".to_owned(),
                Match::Contains("mimikatz".to_owned(), false)
            )
        );
        let expression = parse_kv("CommandLine: mimikatz*").unwrap();
        assert_eq!(
            expression,
            Expression::Field(
                "CommandLine".to_owned(),
                Match::StartsWith("mimikatz".to_owned(), false)
            )
        );
        let expression = parse_kv("CommandLine: *mimikatz").unwrap();
        assert_eq!(
            expression,
            Expression::Field(
                "CommandLine".to_owned(),
                Match::EndsWith("mimikatz".to_owned(), false)
            )
        );
        let expression = parse_kv("CommandLine: mimi?atz").unwrap();
        match expression {
            Expression::Field(_, Match::Regex(regex)) => {
                assert_eq!(regex.as_str(), "^mimi.atz$");
            }
            _ => panic!("expected a regex match"),
        }
    }

    #[test]
    fn parse_modifier_folding() {
        let expression = parse_kv("CommandLine|contains|i: MimiKatz").unwrap();
        assert_eq!(
            expression,
            Expression::Field(
                "CommandLine".to_owned(),
                Match::Contains("mimikatz".to_owned(), true)
            )
        );
    }

    #[test]
    fn parse_contains_all() {
        let detection = parse_detection(
            &yaml(
                r#"
                A:
                    CommandLine|contains|all:
                    - " -enc "
                    - " -nop "
                condition: A
                "#,
            ),
            false,
        )
        .unwrap();
        assert_eq!(
            detection.identifiers.get("A"),
            Some(&Expression::Field(
                "CommandLine".to_owned(),
                Match::AllOf(vec![
                    Match::Contains(" -enc ".to_owned(), false),
                    Match::Contains(" -nop ".to_owned(), false),
                ])
            ))
        );
    }

    #[test]
    fn parse_comparators() {
        let expression = parse_kv("EventID|gte: 4624").unwrap();
        assert_eq!(
            expression,
            Expression::Field(
                "EventID".to_owned(),
                Match::GreaterThanOrEqual(Number::Int(4624))
            )
        );
    }

    #[test]
    fn parse_null_is_presence() {
        let expression = parse_kv("LogonGuid: null").unwrap();
        assert_eq!(
            expression,
            Expression::Group(
                BoolOp::Or,
                vec![
                    Expression::Missing("LogonGuid".to_owned()),
                    Expression::Null("LogonGuid".to_owned()),
                ]
            )
        );
    }

    #[test]
    fn parse_nested_blocks() {
        let expression = parse_expression(
            &yaml(
                r#"
                Payload:
                    Action: pwsh
                "#,
            ),
            false,
        )
        .unwrap();
        assert_eq!(
            expression,
            Expression::Nested(
                "Payload".to_owned(),
                Box::new(Expression::Field(
                    "Action".to_owned(),
                    Match::Equal(Scalar::String("pwsh".to_owned()), false)
                ))
            )
        );
    }

    #[test]
    fn fused_matches_anchors() {
        let fused = Fused::new(
            vec![
                (Anchor::StartsWith, "foo".to_owned()),
                (Anchor::EndsWith, "bar".to_owned()),
            ],
            false,
            true,
        )
        .unwrap();
        assert!(fused.matches("foo baz bar"));
        assert!(!fused.matches("baz foo bar baz"));

        let fused = Fused::new(
            vec![
                (Anchor::Exact, "foo".to_owned()),
                (Anchor::Contains, "bar".to_owned()),
            ],
            false,
            false,
        )
        .unwrap();
        assert!(fused.matches("foo"));
        assert!(fused.matches("a bar b"));
        assert!(!fused.matches("a foo b"));
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("selection*", "selection0"));
        assert!(glob_match("*_filter", "main_filter"));
        assert!(glob_match("sel*ion", "selection"));
        assert!(!glob_match("selection*", "filter"));
        assert!(!glob_match("sel*ion", "selections"));
    }
}
