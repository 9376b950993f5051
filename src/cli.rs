use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use prettytable::{Row, Table, cell, format};
use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::analyse::shimcache::{TimelineEntity, TimelineTimestamp, TimestampType};
use crate::file::Kind as FileKind;
use crate::file::hve::shimcache::EntryType;
use crate::hunt::{Detections, Document, Hunt, Kind};
use crate::rule::Rule;
use crate::tau::Document as TauDocument;
use crate::write::Format;

#[cfg(not(windows))]
pub const RULE_PREFIX: &str = "‣";

#[cfg(windows)]
pub const RULE_PREFIX: &str = "+";

#[cfg(not(windows))]
const TICK_SETTINGS: (&str, u64) = ("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ", 80);

#[cfg(windows)]
const TICK_SETTINGS: (&str, u64) = (r"-\|/-", 200);

pub fn init_progress_bar(size: u64, msg: String) -> ProgressBar {
    let pb = ProgressBar::new(size);
    if crate::writer().quiet {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    } else {
        pb.set_draw_target(ProgressDrawTarget::stderr());
    }
    pb.set_style(
        ProgressStyle::with_template("[+] {msg}: [{bar:40}] {pos}/{len} {spinner}")
            .expect("invalid progress template")
            .tick_chars(TICK_SETTINGS.0)
            .progress_chars("=>-"),
    );
    pb.set_message(msg);
    pb.enable_steady_tick(Duration::from_millis(TICK_SETTINGS.1));
    pb
}

pub fn format_field_length(data: &str, full_output: bool, length: u32) -> String {
    // Take the field and format it for printing, remove newlines and break
    // into even chunks.
    let mut data = data
        .replace('\n', "")
        .replace('\r', "")
        .replace('\t', "")
        .replace("  ", " ")
        .chars()
        .collect::<Vec<char>>()
        .chunks(length as usize)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<String>>()
        .join("\n");

    let truncate_len = 1000;

    if !full_output && data.len() > truncate_len {
        data.truncate(truncate_len);
        data.push_str("...\n\n(use --full to show all content)");
    }

    data
}

fn localise_timestamp(timestamp: &NaiveDateTime, local: bool, timezone: Option<Tz>) -> String {
    if let Some(timezone) = timezone {
        timezone.from_utc_datetime(timestamp).to_rfc3339()
    } else if local {
        Local.from_utc_datetime(timestamp).to_rfc3339()
    } else {
        Utc.from_utc_datetime(timestamp).to_rfc3339()
    }
}

fn tau_to_json(value: crate::tau::Value<'_>) -> Json {
    use crate::tau::Value as Tau;
    match value {
        Tau::Null => Json::Null,
        Tau::Bool(b) => Json::from(b),
        Tau::Float(f) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Tau::Int(i) => Json::from(i),
        Tau::UInt(u) => Json::from(u),
        Tau::String(s) => Json::from(s.as_ref()),
        Tau::Array(a) => serde_json::to_value(a).unwrap_or(Json::Null),
        Tau::Object(o) => serde_json::to_value(o).unwrap_or(Json::Null),
    }
}

/// The fields a hunt extracts from a matching document, keyed by their
/// display names.
fn extract_fields(hunt: &Hunt, document: &Document<'_>) -> Json {
    let wrapper;
    let mapped = match document.kind {
        FileKind::Evtx => {
            wrapper = crate::file::evtx::Wrapper(&document.data);
            hunt.mapper.mapped(&wrapper)
        }
        _ => hunt.mapper.mapped(&document.data),
    };
    let mut fields = Map::new();
    for field in hunt.mapper.fields() {
        if !field.visible {
            continue;
        }
        if let Some(value) = mapped.find(&field.from) {
            fields.insert(field.name.clone(), tau_to_json(value));
        }
    }
    Json::Object(fields)
}

struct TableRow<'a> {
    timestamp: &'a NaiveDateTime,
    documents: Vec<&'a Document<'a>>,
    rules: Vec<&'a Rule>,
}

#[allow(clippy::too_many_arguments)]
pub fn print_detections(
    detections: &[Detections<'_>],
    hunts: &[Hunt],
    rules: &BTreeMap<Uuid, Rule>,
    column_width: u32,
    full: bool,
    local: bool,
    metadata: bool,
    timezone: Option<Tz>,
) {
    let table_format = format::FormatBuilder::new()
        .column_separator('│')
        .borders('│')
        .separators(
            &[format::LinePosition::Top],
            format::LineSeparator::new('─', '┬', '┌', '┐'),
        )
        .separators(
            &[format::LinePosition::Intern],
            format::LineSeparator::new('─', '┼', '├', '┤'),
        )
        .separators(
            &[format::LinePosition::Bottom],
            format::LineSeparator::new('─', '┴', '└', '┘'),
        )
        .padding(1, 1)
        .build();

    let lookup: HashMap<Uuid, usize> = hunts
        .iter()
        .enumerate()
        .map(|(index, hunt)| (hunt.id, index))
        .collect();

    // One table per hunt, keyed by hunt position so output order is stable.
    let mut grouped: BTreeMap<usize, Vec<TableRow<'_>>> = BTreeMap::new();
    for detection in detections {
        let documents: Vec<&Document<'_>> = match &detection.kind {
            Kind::Individual { document } => vec![document],
            Kind::Aggregate { documents } => documents.iter().collect(),
        };
        let mut hits: BTreeMap<usize, TableRow<'_>> = BTreeMap::new();
        for hit in &detection.hits {
            let index = match lookup.get(&hit.hunt) {
                Some(index) => *index,
                None => continue,
            };
            let rule = match rules.get(&hit.rule) {
                Some(rule) => rule,
                None => continue,
            };
            hits.entry(index)
                .or_insert_with(|| TableRow {
                    timestamp: &hit.timestamp,
                    documents: documents.clone(),
                    rules: vec![],
                })
                .rules
                .push(rule);
        }
        for (index, row) in hits {
            grouped.entry(index).or_default().push(row);
        }
    }

    for (index, mut group) in grouped {
        let hunt = &hunts[index];
        group.sort_by(|x, y| {
            let left = (
                x.timestamp,
                x.documents.first().map(|d| d.path),
                x.documents.first().and_then(|d| d.record_id),
            );
            let right = (
                y.timestamp,
                y.documents.first().map(|d| d.path),
                y.documents.first().and_then(|d| d.record_id),
            );
            left.cmp(&right)
        });

        let mut table = Table::new();
        table.set_format(table_format);
        let mut header = vec![
            cell!("timestamp").style_spec("c"),
            cell!("detections").style_spec("c"),
        ];
        let visible: Vec<_> = hunt.mapper.fields().iter().filter(|f| f.visible).collect();
        if visible.is_empty() {
            header.push(cell!("data").style_spec("c"));
        } else {
            for field in &visible {
                header.push(cell!(field.name).style_spec("c"));
            }
        }
        table.add_row(Row::new(header));

        for row in group {
            let localised = localise_timestamp(row.timestamp, local, timezone);
            let mut cells = vec![cell!(localised)];

            let mut names: Vec<&str> = row.rules.iter().map(|r| r.name().as_str()).collect();
            names.sort();
            if metadata {
                let mut inner = Table::new();
                inner.add_row(Row::new(vec![
                    cell!("name").style_spec("c"),
                    cell!("authors").style_spec("c"),
                    cell!("level").style_spec("c"),
                    cell!("status").style_spec("c"),
                ]));
                for rule in &row.rules {
                    let authors = match rule {
                        Rule::Chainsaw(c) => c.authors.join("\n"),
                        Rule::Sigma(s) => s.authors.join("\n"),
                    };
                    inner.add_row(Row::new(vec![
                        cell!(rule.name()),
                        cell!(authors),
                        cell!(rule.level()),
                        cell!(rule.status()),
                    ]));
                }
                cells.push(cell!(inner));
            } else {
                let mut tags = names
                    .iter()
                    .map(|name| format!("{} {}", RULE_PREFIX, name))
                    .collect::<Vec<_>>()
                    .join("\n");
                if row.documents.len() > 1 {
                    tags.push_str(&format!("\n(x{})", row.documents.len()));
                }
                cells.push(cell!(tags));
            }

            let document = match row.documents.first() {
                Some(document) => document,
                None => continue,
            };
            if visible.is_empty() {
                let json = document.data.to_json();
                cells.push(cell!(format_field_length(&json, false, column_width)));
            } else {
                let fields = extract_fields(hunt, document);
                for field in &visible {
                    match fields.get(&field.name) {
                        Some(Json::Null) | None => cells.push(cell!("")),
                        Some(Json::String(s)) => {
                            cells.push(cell!(format_field_length(s, full, column_width)))
                        }
                        Some(value) => cells.push(cell!(format_field_length(
                            &value.to_string(),
                            full,
                            column_width
                        ))),
                    }
                }
            }
            table.add_row(Row::new(cells));
        }

        cs_egreenln!("\n[+] Group: {}", hunt.group);
        cs_print_table!(table);
    }
}

fn detection_object(
    hunt: &Hunt,
    rule: &Rule,
    detection: &Detections<'_>,
    timestamp: String,
) -> crate::Result<Json> {
    let mut object = Map::new();
    object.insert("group".to_string(), Json::from(hunt.group.clone()));
    object.insert("name".to_string(), Json::from(rule.name().clone()));
    object.insert("source".to_string(), Json::from(rule.kind().to_string()));
    object.insert("level".to_string(), Json::from(rule.level().to_string()));
    object.insert("status".to_string(), Json::from(rule.status().to_string()));
    let authors = match rule {
        Rule::Chainsaw(c) => c.authors.clone(),
        Rule::Sigma(s) => s.authors.clone(),
    };
    object.insert("authors".to_string(), serde_json::to_value(authors)?);
    object.insert("timestamp".to_string(), Json::from(timestamp));
    match &detection.kind {
        Kind::Individual { document } => {
            object.insert("fields".to_string(), extract_fields(hunt, document));
            object.insert("document".to_string(), serde_json::to_value(document)?);
        }
        Kind::Aggregate { documents } => {
            if let Some(document) = documents.first() {
                object.insert("fields".to_string(), extract_fields(hunt, document));
            }
            object.insert("count".to_string(), Json::from(documents.len()));
            object.insert("documents".to_string(), serde_json::to_value(documents)?);
        }
    }
    Ok(Json::Object(object))
}

fn detection_objects(
    detections: &[Detections<'_>],
    hunts: &[Hunt],
    rules: &BTreeMap<Uuid, Rule>,
    local: bool,
    timezone: Option<Tz>,
) -> crate::Result<Vec<Json>> {
    let lookup: HashMap<Uuid, &Hunt> = hunts.iter().map(|hunt| (hunt.id, hunt)).collect();
    let mut objects = vec![];
    for detection in detections {
        for hit in &detection.hits {
            let hunt = match lookup.get(&hit.hunt) {
                Some(hunt) => hunt,
                None => continue,
            };
            let rule = match rules.get(&hit.rule) {
                Some(rule) => rule,
                None => continue,
            };
            let timestamp = localise_timestamp(&hit.timestamp, local, timezone);
            objects.push(detection_object(hunt, rule, detection, timestamp)?);
        }
    }
    Ok(objects)
}

pub fn print_json(
    detections: &[Detections<'_>],
    hunts: &[Hunt],
    rules: &BTreeMap<Uuid, Rule>,
    local: bool,
    timezone: Option<Tz>,
) -> crate::Result<()> {
    let objects = detection_objects(detections, hunts, rules, local, timezone)?;
    cs_print_json!(&objects)?;
    cs_println!();
    Ok(())
}

pub fn print_jsonl(
    detections: &[Detections<'_>],
    hunts: &[Hunt],
    rules: &BTreeMap<Uuid, Rule>,
    local: bool,
    timezone: Option<Tz>,
) -> crate::Result<()> {
    let objects = detection_objects(detections, hunts, rules, local, timezone)?;
    for object in &objects {
        cs_print_json!(object)?;
        cs_println!();
    }
    Ok(())
}

/// The CSV shimcache timeline: one row per cache entry, annotated with
/// whatever timestamp evidence the analyser pinned to it.
pub fn print_shimcache_timeline(entities: &[TimelineEntity]) -> crate::Result<()> {
    let mut csv = csv::Writer::from_writer(vec![]);
    csv.write_record([
        "position",
        "timestamp",
        "timestamp_type",
        "range_start",
        "range_end",
        "entry",
        "executed",
        "amcache_sha1",
        "amcache_link_date",
    ])?;
    for entity in entities {
        let entry = match &entity.shimcache_entry {
            Some(entry) => entry,
            None => continue,
        };
        let (timestamp, kind, range_start, range_end) = match &entity.timestamp {
            Some(TimelineTimestamp::Exact(ts, source)) => {
                let source = match source {
                    TimestampType::AmcacheRangeMatch => "amcache_range_match",
                    TimestampType::NearTSMatch => "near_timestamp_match",
                    TimestampType::PatternMatch => "pattern_match",
                    TimestampType::ShimcacheLastUpdate => "shimcache_last_update",
                };
                (ts.to_rfc3339(), source, String::new(), String::new())
            }
            Some(TimelineTimestamp::Range { from, to }) => (
                String::new(),
                "range",
                from.to_rfc3339(),
                to.to_rfc3339(),
            ),
            Some(TimelineTimestamp::RangeStart(from)) => {
                (String::new(), "range_start", from.to_rfc3339(), String::new())
            }
            Some(TimelineTimestamp::RangeEnd(to)) => {
                (String::new(), "range_end", String::new(), to.to_rfc3339())
            }
            None => (String::new(), "", String::new(), String::new()),
        };
        let name = match &entry.entry_type {
            EntryType::File { path } => path.clone(),
            EntryType::Program { program_name, .. } => program_name.clone(),
        };
        let executed = entry
            .executed
            .map(|e| e.to_string())
            .unwrap_or_default();
        let sha1 = entity
            .amcache_file
            .as_ref()
            .and_then(|f| f.sha1_hash.clone())
            .unwrap_or_default();
        let link_date = entity
            .amcache_file
            .as_ref()
            .and_then(|f| f.link_date.map(|d| d.to_rfc3339()))
            .unwrap_or_default();
        csv.write_record([
            entry.cache_entry_position.to_string(),
            timestamp,
            kind.to_string(),
            range_start,
            range_end,
            name,
            executed,
            sha1,
            link_date,
        ])?;
    }
    let rendered = csv
        .into_inner()
        .map_err(|e| anyhow!("could not flush csv - {}", e))?;
    cs_print!("{}", String::from_utf8(rendered)?);
    Ok(())
}

pub fn print_srum_database_info(
    info: &crate::analyse::srum::SrumDbInfo,
    stats_only: bool,
) -> crate::Result<()> {
    if stats_only {
        let table = &info.table_details;
        cs_print_table!(table);
    } else {
        cs_print_json_pretty!(&info.db_content)?;
        cs_println!();
    }
    Ok(())
}

/// Routes a stream of plain documents to the selected output format.
pub struct DocumentRenderer {
    count: usize,
}

impl DocumentRenderer {
    pub fn new() -> Self {
        Self { count: 0 }
    }

    pub fn render(&mut self, data: &crate::value::Value) -> crate::Result<()> {
        match crate::writer().format {
            Format::Std => {
                cs_println!("---");
                cs_print!("{}", data.to_json_pretty());
                cs_println!();
            }
            Format::Json => {
                if self.count == 0 {
                    cs_print!("[");
                } else {
                    cs_print!(",");
                }
                cs_print!("{}", data.to_json_pretty());
            }
            Format::Jsonl => {
                cs_print!("{}", data.to_json());
                cs_println!();
            }
        }
        self.count += 1;
        Ok(())
    }

    pub fn close(&mut self) -> crate::Result<()> {
        if let Format::Json = crate::writer().format {
            if self.count == 0 {
                cs_print!("[");
            }
            cs_println!("]");
        }
        Ok(())
    }
}

impl Default for DocumentRenderer {
    fn default() -> Self {
        Self::new()
    }
}
