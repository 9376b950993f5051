use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
// https://github.com/rust-lang/rust/issues/74465
use once_cell::sync::OnceCell;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::file::{Document as File, Kind as FileKind, Reader};
use crate::rule::{
    Aggregate, Filter, Kind as RuleKind, Rule,
    chainsaw::{Cast, Container, Field, Format},
};
use crate::tau::{self, Document as TauDocument, Expression, Value as Tau};
use crate::value::{Value, parse_datetime};

/// A mapping file: for one rule dialect and one artefact shape, the groups
/// of logical fields that let portable rules evaluate against it.
#[derive(Deserialize)]
pub struct Mapping {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub exclusions: HashSet<String>,
    pub groups: Vec<Group>,
    pub kind: FileKind,
    pub rules: RuleKind,
}

#[derive(Clone, Deserialize)]
pub struct Group {
    #[serde(skip, default = "Uuid::new_v4")]
    pub id: Uuid,
    pub fields: Vec<Field>,
    #[serde(deserialize_with = "crate::tau::deserialize_expression")]
    pub filter: Expression,
    pub name: String,
    pub timestamp: String,
}

pub struct Hit {
    pub hunt: Uuid,
    pub rule: Uuid,
    pub timestamp: NaiveDateTime,
}

pub struct Detections<'a> {
    pub hits: SmallVec<[Hit; 1]>,
    pub kind: Kind<'a>,
}

#[derive(Debug, Serialize)]
pub struct Document<'a> {
    pub kind: FileKind,
    pub path: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<u64>,
    pub data: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Kind<'a> {
    Aggregate { documents: Vec<Document<'a>> },
    Individual { document: Document<'a> },
}

#[derive(Default)]
pub struct HunterBuilder {
    mappings: Option<Vec<PathBuf>>,
    rules: Option<Vec<Rule>>,

    load_unknown: Option<bool>,
    local: Option<bool>,
    from: Option<NaiveDateTime>,
    skip_errors: Option<bool>,
    timezone: Option<Tz>,
    to: Option<NaiveDateTime>,
}

impl HunterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> crate::Result<Hunter> {
        let mut hunts = vec![];
        let rules = match self.rules {
            Some(mut rules) => {
                rules.sort_by(|x, y| x.name().cmp(y.name()));
                let mut map = BTreeMap::new();
                for rule in rules {
                    let uuid = Uuid::new_v4();
                    if let Rule::Chainsaw(rule) = &rule {
                        let mapper = Mapper::from(rule.fields.clone());
                        hunts.push(Hunt {
                            id: uuid,

                            group: rule.group.clone(),
                            kind: HuntKind::Rule {
                                aggregate: rule.aggregate.clone(),
                                filter: rule.filter.clone(),
                            },
                            timestamp: rule.timestamp.clone(),

                            file: rule.kind.clone(),
                            mapper,
                        });
                    }
                    map.insert(uuid, rule);
                }
                map
            }
            None => BTreeMap::new(),
        };
        if let Some(mut mappings) = self.mappings {
            mappings.sort();
            for mapping in mappings {
                let content = match fs::read_to_string(&mapping) {
                    Ok(content) => content,
                    Err(e) => anyhow::bail!("Error loading specified mapping file - {}", e),
                };
                let mut mapping: Mapping = match serde_yaml::from_str(&content) {
                    Ok(mapping) => mapping,
                    Err(e) => anyhow::bail!("Provided mapping file is invalid - {}", e),
                };
                if let RuleKind::Chainsaw = mapping.rules {
                    anyhow::bail!("Chainsaw rules do not support mappings");
                }
                mapping.groups.sort_by(|x, y| x.name.cmp(&y.name));
                for group in mapping.groups {
                    let mut exclusions = HashSet::new();
                    for (rid, rule) in &rules {
                        if mapping.exclusions.contains(rule.name()) {
                            exclusions.insert(*rid);
                        }
                    }
                    let mapper = Mapper::from(group.fields);
                    // FIXME: Due to how file types are handled we lose jsonl,
                    // as its file type internally here is json, so we coerce
                    // it for now... Putting a match here will make sure we
                    // don't make this mistake again until its handled
                    // properly.
                    let file = match mapping.kind {
                        FileKind::Evtx => FileKind::Evtx,
                        FileKind::Hve => FileKind::Hve,
                        FileKind::Json => FileKind::Json,
                        FileKind::Jsonl => FileKind::Json,
                        FileKind::Mft => FileKind::Mft,
                        FileKind::Xml => FileKind::Xml,
                        FileKind::Esedb => FileKind::Esedb,
                        FileKind::Unknown => anyhow::bail!("mappings must declare a file kind"),
                    };
                    hunts.push(Hunt {
                        id: group.id,

                        group: group.name,
                        kind: HuntKind::Group {
                            exclusions,
                            filter: group.filter,
                            kind: mapping.rules.clone(),
                        },
                        timestamp: group.timestamp,

                        file,
                        mapper,
                    });
                }
            }
        }

        let load_unknown = self.load_unknown.unwrap_or_default();
        let local = self.local.unwrap_or_default();
        let skip_errors = self.skip_errors.unwrap_or_default();

        let mut from = None;
        let mut to = None;
        if let Some(timestamp) = self.from {
            from = Some(localise(timestamp, local, self.timezone)?);
        }
        if let Some(timestamp) = self.to {
            to = Some(localise(timestamp, local, self.timezone)?);
        }

        Ok(Hunter {
            inner: HunterInner {
                hunts,
                rules,

                from,
                load_unknown,
                skip_errors,
                to,
            },
        })
    }

    pub fn from(mut self, datetime: NaiveDateTime) -> Self {
        self.from = Some(datetime);
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

    pub fn mappings(mut self, paths: Vec<PathBuf>) -> Self {
        self.mappings = Some(paths);
        self
    }

    pub fn rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn skip_errors(mut self, skip: bool) -> Self {
        self.skip_errors = Some(skip);
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

pub enum HuntKind {
    Group {
        exclusions: HashSet<Uuid>,
        filter: Expression,
        kind: RuleKind,
    },
    Rule {
        aggregate: Option<Aggregate>,
        filter: Filter,
    },
}

pub enum MapperKind {
    None,
    Fast(FxHashMap<String, String>),
    Full(FxHashMap<String, (String, Option<Container>, Option<Cast>)>),
}

pub struct Mapper {
    fields: Vec<Field>,
    kind: MapperKind,
}

impl Mapper {
    pub fn from(fields: Vec<Field>) -> Self {
        let mut fast = false;
        let mut full = false;
        for field in &fields {
            if field.cast.is_some() || field.container.is_some() {
                full = true;
                break;
            }
            if field.from != field.to {
                fast = true;
            }
        }
        let kind = if full {
            let mut map = FxHashMap::default();
            for field in &fields {
                map.insert(
                    field.from.clone(),
                    (
                        field.to.clone(),
                        field.container.clone(),
                        field.cast.clone(),
                    ),
                );
            }
            MapperKind::Full(map)
        } else if fast {
            let mut map = FxHashMap::default();
            for field in &fields {
                map.insert(field.from.clone(), field.to.clone());
            }
            MapperKind::Fast(map)
        } else {
            MapperKind::None
        };
        Self { fields, kind }
    }

    pub fn fields(&self) -> &Vec<Field> {
        &self.fields
    }

    pub fn mapped<'a, D>(&'a self, document: &'a D) -> Mapped<'a>
    where
        D: TauDocument,
    {
        Mapped {
            cache: OnceCell::new(),
            document,
            mapper: self,
        }
    }
}

/// A mapping-aware view of a document: unqualified names resolve through the
/// field table, dotted paths bypass it.
pub struct Mapped<'a> {
    cache: OnceCell<FxHashMap<String, Box<dyn TauDocument + 'a>>>,
    document: &'a dyn TauDocument,
    mapper: &'a Mapper,
}

impl TauDocument for Mapped<'_> {
    fn find(&self, key: &str) -> Option<Tau<'_>> {
        if key.contains('.') {
            return self.document.find(key);
        }
        match &self.mapper.kind {
            MapperKind::None => self.document.find(key),
            MapperKind::Fast(map) => match map.get(key) {
                Some(v) => self.document.find(v),
                None => self.document.find(key),
            },
            MapperKind::Full(map) => match map.get(key) {
                Some((v, Some(container), None)) => {
                    if let Some(cache) = self.cache.get() {
                        return cache.get(&container.field).and_then(|hit| hit.find(v));
                    }
                    // Due to referencing and ownership, we parse all
                    // containers at once, which then allows us to use a
                    // OnceCell.
                    let mut lookup: FxHashMap<String, Box<dyn TauDocument>> = FxHashMap::default();
                    for field in &self.mapper.fields {
                        if let Some(container) = &field.container {
                            if !lookup.contains_key(&container.field) {
                                let data = match self.document.find(&container.field) {
                                    Some(Tau::String(s)) => match container.format {
                                        Format::Json => {
                                            match serde_json::from_str::<Value>(&s) {
                                                Ok(value) => {
                                                    Box::new(value) as Box<dyn TauDocument>
                                                }
                                                Err(_) => continue,
                                            }
                                        }
                                        Format::Kv {
                                            ref delimiter,
                                            ref separator,
                                            trim,
                                        } => {
                                            let mut map = crate::value::Map::default();
                                            for item in s.split(delimiter.as_str()) {
                                                let cleaned =
                                                    if trim { item.trim() } else { item };
                                                if let Some((k, v)) =
                                                    cleaned.split_once(separator.as_str())
                                                {
                                                    map.insert(
                                                        k.to_owned(),
                                                        Value::String(v.to_owned()),
                                                    );
                                                }
                                            }
                                            Box::new(map) as Box<dyn TauDocument>
                                        }
                                    },
                                    _ => continue,
                                };
                                lookup.insert(container.field.clone(), data);
                            }
                        }
                    }
                    if self.cache.set(lookup).is_err() {
                        panic!("cache is already set!");
                    }
                    self.cache
                        .get()
                        .and_then(|cache| cache.get(&container.field))
                        .and_then(|hit| hit.find(v))
                }
                Some((v, None, Some(cast))) => match cast {
                    Cast::Int => match self.document.find(v) {
                        Some(value) => {
                            // NOTE: We only parse strings into i64 for now,
                            // we leave the other types alone...
                            if let Tau::String(s) = &value {
                                if let Ok(i) = str::parse::<i64>(s) {
                                    return Some(Tau::Int(i));
                                }
                            }
                            Some(value)
                        }
                        value => value,
                    },
                    Cast::Str => match self.document.find(v) {
                        Some(value) => value.to_display().map(|s| Tau::String(Cow::Owned(s))),
                        value => value,
                    },
                },
                Some((v, None, None)) => self.document.find(v),
                _ => self.document.find(key),
            },
        }
    }

    fn as_text(&self) -> Option<String> {
        self.document.as_text()
    }
}

pub struct Hunt {
    pub id: Uuid,
    pub group: String,
    pub kind: HuntKind,
    pub mapper: Mapper,
    pub timestamp: String,

    pub file: FileKind,
}

pub struct HunterInner {
    hunts: Vec<Hunt>,
    rules: BTreeMap<Uuid, Rule>,

    load_unknown: bool,
    from: Option<DateTime<Utc>>,
    skip_errors: bool,
    to: Option<DateTime<Utc>>,
}

pub struct Hunter {
    inner: HunterInner,
}

impl Hunter {
    pub fn builder() -> HunterBuilder {
        HunterBuilder::new()
    }

    pub fn hunt<'a>(&'a self, file: &'a Path) -> crate::Result<Vec<Detections<'a>>> {
        let mut reader = Reader::load(file, self.inner.load_unknown, self.inner.skip_errors)?;
        #[allow(clippy::type_complexity)]
        let aggregates: Mutex<FxHashMap<(usize, Uuid), (&Aggregate, FxHashMap<u64, Vec<Uuid>>)>> =
            Mutex::new(FxHashMap::default());
        #[allow(clippy::type_complexity)]
        let documents: Mutex<FxHashMap<Uuid, (Value, FileKind, u64, NaiveDateTime)>> =
            Mutex::new(FxHashMap::default());
        let mut detections = reader
            .documents()
            .enumerate()
            .par_bridge()
            .filter_map(|(index, document)| {
                let document_id = Uuid::new_v4();
                let document = match document {
                    Ok(document) => document,
                    Err(e) => {
                        if self.inner.skip_errors {
                            cs_eyellowln!(
                                "[!] failed to parse document '{}' - {}",
                                file.display(),
                                e
                            );
                            return None;
                        }
                        return Some(Err(anyhow!("{} in {}", e, file.display())));
                    }
                };
                let (kind, value): (FileKind, Value) = match document {
                    File::Evtx(evtx) => (FileKind::Evtx, evtx.data.into()),
                    File::Hve(hve) => (FileKind::Hve, hve.into()),
                    File::Json(json) => (FileKind::Json, json.into()),
                    File::Mft(mft) => (FileKind::Mft, mft.into()),
                    File::Xml(xml) => (FileKind::Xml, xml.into()),
                    File::Esedb(esedb) => (FileKind::Esedb, esedb.into()),
                };
                let record_id = (index + 1) as u64;
                let mut hits: SmallVec<[Hit; 1]> = smallvec::smallvec![];
                for (hunt_index, hunt) in self.inner.hunts.iter().enumerate() {
                    if hunt.file != kind {
                        continue;
                    }

                    let wrapper;
                    let mapped = match &kind {
                        FileKind::Evtx => {
                            wrapper = crate::file::evtx::Wrapper(&value);
                            hunt.mapper.mapped(&wrapper)
                        }
                        _ => hunt.mapper.mapped(&value),
                    };

                    let timestamp = match mapped.find(&hunt.timestamp) {
                        Some(value) => match value.as_str() {
                            Some(timestamp) => match parse_datetime(timestamp) {
                                Ok(timestamp) => timestamp,
                                Err(e) => {
                                    if self.inner.skip_errors {
                                        cs_eyellowln!("[!] {}", e);
                                        return None;
                                    }
                                    return Some(Err(e));
                                }
                            },
                            None => continue,
                        },
                        None => continue,
                    };

                    if self.skip(timestamp) {
                        continue;
                    }

                    match &hunt.kind {
                        HuntKind::Group {
                            exclusions,
                            filter,
                            kind: rule_kind,
                        } => {
                            if tau::solve(filter, &mapped) {
                                for (rid, rule) in &self.inner.rules {
                                    if !rule.is_kind(rule_kind) {
                                        continue;
                                    }
                                    if exclusions.contains(rid) {
                                        continue;
                                    }
                                    if !rule.solve(&mapped) {
                                        continue;
                                    }
                                    if let Some(aggregate) = rule.aggregate() {
                                        let mut hasher = FxHasher::default();
                                        let mut skip = false;
                                        for field in &aggregate.fields {
                                            match mapped
                                                .find(field)
                                                .and_then(|v| v.to_display())
                                            {
                                                Some(value) => value.hash(&mut hasher),
                                                None => {
                                                    skip = true;
                                                    break;
                                                }
                                            }
                                        }
                                        if skip {
                                            continue;
                                        }
                                        documents
                                            .lock()
                                            .expect("could not lock documents")
                                            .insert(
                                                document_id,
                                                (
                                                    value.clone(),
                                                    kind.clone(),
                                                    record_id,
                                                    timestamp,
                                                ),
                                            );
                                        let id = hasher.finish();
                                        let mut aggregates = aggregates
                                            .lock()
                                            .expect("could not lock aggregates");
                                        let bucket = aggregates
                                            .entry((hunt_index, *rid))
                                            .or_insert((aggregate, FxHashMap::default()));
                                        bucket.1.entry(id).or_default().push(document_id);
                                    } else {
                                        hits.push(Hit {
                                            hunt: hunt.id,
                                            rule: *rid,
                                            timestamp,
                                        });
                                    }
                                }
                            }
                        }
                        HuntKind::Rule { aggregate, filter } => {
                            let hit = match &filter {
                                Filter::Detection(detection) => {
                                    tau::solve(&detection.expression, &mapped)
                                }
                                Filter::Expression(expression) => tau::solve(expression, &mapped),
                            };
                            if hit {
                                if let Some(aggregate) = aggregate {
                                    let mut hasher = FxHasher::default();
                                    let mut skip = false;
                                    for field in &aggregate.fields {
                                        match mapped.find(field).and_then(|v| v.to_display()) {
                                            Some(value) => value.hash(&mut hasher),
                                            None => {
                                                skip = true;
                                                break;
                                            }
                                        }
                                    }
                                    if skip {
                                        continue;
                                    }
                                    documents
                                        .lock()
                                        .expect("could not lock documents")
                                        .insert(
                                            document_id,
                                            (value.clone(), kind.clone(), record_id, timestamp),
                                        );
                                    let id = hasher.finish();
                                    let mut aggregates =
                                        aggregates.lock().expect("could not lock aggregates");
                                    let bucket = aggregates
                                        .entry((hunt_index, hunt.id))
                                        .or_insert((aggregate, FxHashMap::default()));
                                    bucket.1.entry(id).or_default().push(document_id);
                                } else {
                                    hits.push(Hit {
                                        hunt: hunt.id,
                                        rule: hunt.id,
                                        timestamp,
                                    });
                                }
                            }
                        }
                    }
                }
                if !hits.is_empty() {
                    Some(Ok((
                        index,
                        Detections {
                            hits,
                            kind: Kind::Individual {
                                document: Document {
                                    kind,
                                    path: file,
                                    record_id: Some(record_id),
                                    data: value,
                                },
                            },
                        },
                    )))
                } else {
                    None
                }
            })
            .collect::<crate::Result<Vec<(usize, Detections<'a>)>>>()?;
        // Parallel evaluation loses source order, restore it.
        detections.sort_by_key(|(index, _)| *index);
        let mut detections: Vec<Detections<'a>> =
            detections.into_iter().map(|(_, detections)| detections).collect();

        let aggregates = aggregates.into_inner().expect("could not lock aggregates");
        let documents = documents.into_inner().expect("could not lock documents");
        let mut keys: Vec<&(usize, Uuid)> = aggregates.keys().collect();
        keys.sort();
        for key in keys {
            let (hunt_index, rid) = key;
            let (aggregate, buckets) = aggregates.get(key).expect("could not get aggregate");
            let hunt = &self.inner.hunts[*hunt_index];
            let mut bucket_ids: Vec<&u64> = buckets.keys().collect();
            bucket_ids.sort();
            for bucket_id in bucket_ids {
                let ids = buckets.get(bucket_id).expect("could not get bucket");
                if !aggregate.count.matches(ids.len()) {
                    continue;
                }
                let mut entries: Vec<&(Value, FileKind, u64, NaiveDateTime)> = ids
                    .iter()
                    .map(|id| documents.get(id).expect("could not get document"))
                    .collect();
                entries.sort_by_key(|(_, _, record_id, _)| *record_id);
                let timestamp = entries
                    .iter()
                    .map(|(_, _, _, timestamp)| *timestamp)
                    .min()
                    .expect("could not get timestamp");
                let docs = entries
                    .into_iter()
                    .map(|(value, kind, record_id, _)| Document {
                        kind: kind.clone(),
                        path: file,
                        record_id: Some(*record_id),
                        data: value.clone(),
                    })
                    .collect();
                detections.push(Detections {
                    hits: smallvec::smallvec![Hit {
                        hunt: hunt.id,
                        rule: *rid,
                        timestamp,
                    }],
                    kind: Kind::Aggregate { documents: docs },
                });
            }
        }
        Ok(detections)
    }

    pub fn extensions(&self) -> HashSet<String> {
        let mut extensions = HashSet::new();
        for rule in &self.inner.rules {
            if let Some(e) = FileKind::extensions(rule.1.types()) {
                extensions.extend(e.iter().cloned());
            }
        }
        for hunt in &self.inner.hunts {
            if let Some(e) = FileKind::extensions(&hunt.file) {
                extensions.extend(e.iter().cloned());
            }
            if hunt.file == FileKind::Json {
                // The json coercion above means jsonl hunts advertise json,
                // make sure their own extension stays reachable.
                if let Some(e) = FileKind::extensions(&FileKind::Jsonl) {
                    extensions.extend(e.iter().cloned());
                }
            }
        }
        extensions
    }

    pub fn hunts(&self) -> &Vec<Hunt> {
        &self.inner.hunts
    }

    pub fn rules(&self) -> &BTreeMap<Uuid, Rule> {
        &self.inner.rules
    }

    fn skip(&self, timestamp: NaiveDateTime) -> bool {
        if self.inner.from.is_some() || self.inner.to.is_some() {
            let localised = Utc.from_utc_datetime(&timestamp);
            // Both window ends are exclusive.
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
        }
        false
    }
}
