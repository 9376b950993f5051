use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::{RegexSet, RegexSetBuilder};

use crate::file::{Document as File, Kind as FileKind, Reader};
use crate::tau::{self, BoolOp, Expression};
use crate::value::{Value, parse_datetime};

pub struct SearchResult<'a> {
    pub data: Value,
    pub source: &'a Path,
    pub record_id: Option<u64>,
    pub timestamp: Option<NaiveDateTime>,
}

#[derive(Default)]
pub struct SearcherBuilder {
    patterns: Option<Vec<String>>,
    tau: Option<Vec<String>>,

    from: Option<NaiveDateTime>,
    ignore_case: Option<bool>,
    load_unknown: Option<bool>,
    local: Option<bool>,
    match_any: Option<bool>,
    skip_errors: Option<bool>,
    timestamp: Option<String>,
    timezone: Option<Tz>,
    to: Option<NaiveDateTime>,
}

impl SearcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> crate::Result<Searcher> {
        let ignore_case = self.ignore_case.unwrap_or_default();
        let load_unknown = self.load_unknown.unwrap_or_default();
        let local = self.local.unwrap_or_default();
        let match_any = self.match_any.unwrap_or_default();
        let skip_errors = self.skip_errors.unwrap_or_default();

        let patterns = self.patterns.unwrap_or_default();
        let regex = RegexSetBuilder::new(&patterns)
            .case_insensitive(ignore_case)
            .build()?;

        let tau = match self.tau {
            Some(kvs) => {
                let mut expressions = Vec::with_capacity(kvs.len());
                for kv in &kvs {
                    expressions.push(tau::parse_kv(kv)?);
                }
                if expressions.is_empty() {
                    None
                } else if expressions.len() == 1 {
                    Some(expressions.remove(0))
                } else if match_any {
                    Some(Expression::Group(BoolOp::Or, expressions))
                } else {
                    Some(Expression::Group(BoolOp::And, expressions))
                }
            }
            None => None,
        };

        let mut from = None;
        let mut to = None;
        if let Some(timestamp) = self.from {
            from = Some(localise(timestamp, local, self.timezone)?);
        }
        if let Some(timestamp) = self.to {
            to = Some(localise(timestamp, local, self.timezone)?);
        }

        Ok(Searcher {
            inner: SearcherInner {
                regex,
                tau,

                from,
                load_unknown,
                match_any,
                skip_errors,
                timestamp: self.timestamp,
                to,
            },
        })
    }

    pub fn from(mut self, datetime: NaiveDateTime) -> Self {
        self.from = Some(datetime);
        self
    }

    pub fn ignore_case(mut self, ignore: bool) -> Self {
        self.ignore_case = Some(ignore);
        self
    }

    pub fn load_unknown(mut self, allow: bool) -> Self {
        self.load_unknown = Some(allow);
        self
    }

    pub fn local(mut self, local: bool) -> Self {
        self.local = Some(local);
        self
    }

    pub fn match_any(mut self, any: bool) -> Self {
        self.match_any = Some(any);
        self
    }

    pub fn patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    pub fn skip_errors(mut self, skip: bool) -> Self {
        self.skip_errors = Some(skip);
        self
    }

    pub fn tau(mut self, kvs: Vec<String>) -> Self {
        self.tau = Some(kvs);
        self
    }

    pub fn timestamp(mut self, field: String) -> Self {
        self.timestamp = Some(field);
        self
    }

    pub fn timezone(mut self, tz: Tz) -> Self {
        self.timezone = Some(tz);
        self
    }

    pub fn to(mut self, datetime: NaiveDateTime) -> Self {
        self.to = Some(datetime);
        self
    }
}

fn localise(
    timestamp: NaiveDateTime,
    local: bool,
    timezone: Option<Tz>,
) -> crate::Result<DateTime<Utc>> {
    if let Some(timezone) = timezone {
        let local = timezone
            .from_local_datetime(&timestamp)
            .single()
            .ok_or_else(|| anyhow!("failed to localise timestamp"))?;
        Ok(local.with_timezone(&Utc))
    } else if local {
        let local = Utc
            .from_local_datetime(&timestamp)
            .single()
            .ok_or_else(|| anyhow!("failed to localise timestamp"))?;
        Ok(local)
    } else {
        Ok(Utc.from_utc_datetime(&timestamp))
    }
}

pub struct SearcherInner {
    regex: RegexSet,
    tau: Option<Expression>,

    from: Option<DateTime<Utc>>,
    load_unknown: bool,
    match_any: bool,
    skip_errors: bool,
    timestamp: Option<String>,
    to: Option<DateTime<Utc>>,
}

pub struct Searcher {
    inner: SearcherInner,
}

/// The searcher-only regex haystack: a serialised document with runs of four
/// backslashes collapsed to two, so patterns match the strings rule authors
/// see. Documents themselves are never mutated.
pub fn normalize_json_for_search(json: &str) -> String {
    json.replace(r"\\", r"\")
}

impl Searcher {
    pub fn builder() -> SearcherBuilder {
        SearcherBuilder::new()
    }

    /// Searches one file, checking each document against the time window,
    /// then the tau set, then the regex set. With no criteria at all every
    /// document matches.
    pub fn search<'a>(&self, file: &'a Path) -> crate::Result<Vec<SearchResult<'a>>> {
        let mut reader = Reader::load(file, self.inner.load_unknown, self.inner.skip_errors)?;
        let kind = reader.kind();
        let mut results = vec![];
        for (index, document) in reader.documents().enumerate() {
            let document = match document {
                Ok(document) => document,
                Err(e) => {
                    if self.inner.skip_errors {
                        cs_eyellowln!(
                            "[!] failed to parse document '{}' - {}",
                            file.display(),
                            e
                        );
                        continue;
                    }
                    anyhow::bail!("{} in {}", e, file.display());
                }
            };
            let value: Value = match document {
                File::Evtx(evtx) => evtx.data.into(),
                File::Hve(hve) => hve.into(),
                File::Json(json) => json.into(),
                File::Mft(mft) => mft.into(),
                File::Xml(xml) => xml.into(),
                File::Esedb(esedb) => esedb.into(),
            };

            let mut timestamp = None;
            if self.inner.from.is_some() || self.inner.to.is_some() {
                let field = match &self.inner.timestamp {
                    Some(field) => field.as_str(),
                    None => match kind {
                        FileKind::Evtx => "Event.System.TimeCreated",
                        _ => anyhow::bail!(
                            "no timestamp field for '{}', specify one with --timestamp",
                            file.display()
                        ),
                    },
                };
                let found = match kind {
                    FileKind::Evtx => {
                        use crate::tau::Document;
                        crate::file::evtx::Wrapper(&value)
                            .find(field)
                            .and_then(|v| v.to_display())
                    }
                    _ => value.find(field).and_then(|v| v.as_str().map(String::from)),
                };
                let parsed = match found {
                    Some(found) => match parse_datetime(&found) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            if self.inner.skip_errors {
                                cs_eyellowln!("[!] {}", e);
                                continue;
                            }
                            return Err(e);
                        }
                    },
                    // No timestamp to check the window against.
                    None => continue,
                };
                if self.skip(parsed) {
                    continue;
                }
                timestamp = Some(parsed);
            }

            if let Some(expression) = &self.inner.tau {
                let solved = match kind {
                    FileKind::Evtx => {
                        tau::solve(expression, &crate::file::evtx::Wrapper(&value))
                    }
                    _ => tau::solve(expression, &value),
                };
                if !solved {
                    continue;
                }
            }

            if !self.inner.regex.is_empty() {
                let text = normalize_json_for_search(&value.to_json());
                let matched = if self.inner.match_any {
                    self.inner.regex.is_match(&text)
                } else {
                    self.inner.regex.matches(&text).iter().count() == self.inner.regex.len()
                };
                if !matched {
                    continue;
                }
            }

            results.push(SearchResult {
                data: value,
                source: file,
                record_id: Some((index + 1) as u64),
                timestamp,
            });
        }
        Ok(results)
    }

    fn skip(&self, timestamp: NaiveDateTime) -> bool {
        let localised = Utc.from_utc_datetime(&timestamp);
        if let Some(from) = self.inner.from {
            if localised <= from {
                return true;
            }
        }
        if let Some(to) = self.inner.to {
            if localised >= to {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_json(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn empty_criteria_match_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(&dir, "data.json", r#"[{"a": 1}, {"a": 2}]"#);
        let searcher = Searcher::builder().build().unwrap();
        let results = searcher.search(&path).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].record_id, Some(1));
        assert_eq!(results[1].record_id, Some(2));
    }

    #[test]
    fn regex_all_or_any() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(
            &dir,
            "data.json",
            r#"[{"a": "foo bar"}, {"a": "foo"}, {"a": "baz"}]"#,
        );
        let patterns = vec!["foo".to_string(), "bar".to_string()];
        let all = Searcher::builder()
            .patterns(patterns.clone())
            .build()
            .unwrap();
        assert_eq!(all.search(&path).unwrap().len(), 1);
        let any = Searcher::builder()
            .patterns(patterns)
            .match_any(true)
            .build()
            .unwrap();
        assert_eq!(any.search(&path).unwrap().len(), 2);
    }

    #[test]
    fn regex_case_folding() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(&dir, "data.json", r#"[{"a": "MIMIKATZ"}]"#);
        let sensitive = Searcher::builder()
            .patterns(vec!["mimikatz".to_string()])
            .build()
            .unwrap();
        assert_eq!(sensitive.search(&path).unwrap().len(), 0);
        let insensitive = Searcher::builder()
            .patterns(vec!["mimikatz".to_string()])
            .ignore_case(true)
            .build()
            .unwrap();
        assert_eq!(insensitive.search(&path).unwrap().len(), 1);
    }

    #[test]
    fn regex_backslash_normalisation() {
        let dir = tempfile::tempdir().unwrap();
        // The document holds `dir\\file`; serialised that is four
        // backslashes, which collapse back to two for matching.
        let path = write_json(&dir, "data.json", r#"[{"a": "dir\\\\file"}]"#);
        let searcher = Searcher::builder()
            .patterns(vec![r"dir\\\\file".to_string()])
            .build()
            .unwrap();
        assert_eq!(searcher.search(&path).unwrap().len(), 1);
    }

    #[test]
    fn invalid_regex_fails_at_build() {
        let result = Searcher::builder()
            .patterns(vec!["[".to_string()])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn tau_filters_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(
            &dir,
            "data.json",
            r#"[{"EventID": 4624, "User": "bob"}, {"EventID": 4624, "User": "alice"}]"#,
        );
        let searcher = Searcher::builder()
            .tau(vec!["EventID: 4624".to_string(), "User: bob".to_string()])
            .build()
            .unwrap();
        assert_eq!(searcher.search(&path).unwrap().len(), 1);
        let searcher = Searcher::builder()
            .tau(vec!["User: bob".to_string(), "User: alice".to_string()])
            .match_any(true)
            .build()
            .unwrap();
        assert_eq!(searcher.search(&path).unwrap().len(), 2);
    }

    #[test]
    fn time_window_is_strict() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(
            &dir,
            "data.json",
            r#"[
                {"timestamp": "2024-01-01T00:00:00Z"},
                {"timestamp": "2024-01-01T12:00:00Z"},
                {"timestamp": "2024-01-02T00:00:00Z"}
            ]"#,
        );
        let searcher = Searcher::builder()
            .timestamp("timestamp".to_string())
            .from(parse_datetime("2024-01-01T00:00:00").unwrap())
            .to(parse_datetime("2024-01-02T00:00:00").unwrap())
            .build()
            .unwrap();
        let results = searcher.search(&path).unwrap();
        // The endpoints themselves are excluded.
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record_id, Some(2));
    }
}
