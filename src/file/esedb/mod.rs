use std::path::Path;

use anyhow::Error;
use chrono::{DateTime, SecondsFormat, Utc};
use libesedb::{EseDb, Value as EseValue};
use serde_json::json;
use serde_json::{Map, Value as Json};

pub mod srum;

pub type Esedb = Json;

pub struct Parser {
    pub database: EseDb,
    pub entries: Vec<Json>,
}

impl Parser {
    pub fn load(file: &Path) -> crate::Result<Self> {
        let database = EseDb::open(file)?;
        Ok(Self {
            database,
            entries: Vec::new(),
        })
    }

    /// Flattens every table into one record stream, each row tagged with its
    /// table name.
    pub fn parse(&mut self) -> impl Iterator<Item = Result<Json, Error>> + 'static {
        let mut entries = vec![];
        let tables = match self.database.iter_tables() {
            Ok(tables) => tables,
            Err(e) => {
                return vec![Err(Error::from(e))].into_iter();
            }
        };
        for table in tables.flatten() {
            let table_name = match table.name() {
                Ok(name) => name,
                Err(e) => {
                    entries.push(Err(Error::from(e)));
                    continue;
                }
            };
            let mut columns = Vec::new();
            match table.iter_columns() {
                Ok(iterator) => {
                    for column in iterator.flatten() {
                        match column.name() {
                            Ok(name) => columns.push(name),
                            Err(e) => {
                                entries.push(Err(Error::from(e)));
                            }
                        }
                    }
                }
                Err(e) => {
                    entries.push(Err(Error::from(e)));
                    continue;
                }
            }
            let records = match table.iter_records() {
                Ok(records) => records,
                Err(e) => {
                    entries.push(Err(Error::from(e)));
                    continue;
                }
            };
            for record in records.flatten() {
                let values = match record.iter_values() {
                    Ok(values) => values,
                    Err(e) => {
                        entries.push(Err(Error::from(e)));
                        continue;
                    }
                };
                let mut row = Map::new();
                row.insert("Table".to_string(), Json::String(table_name.clone()));
                for (value, column) in values.zip(&columns) {
                    let value = value.unwrap_or(EseValue::Null(()));
                    let value = match value {
                        EseValue::DateTime(_) => match value.to_oletime() {
                            Some(st) => {
                                let datetime: DateTime<Utc> = DateTime::from(st);
                                Json::String(datetime.to_rfc3339_opts(SecondsFormat::Secs, true))
                            }
                            None => Json::Null,
                        },
                        EseValue::I64(v) | EseValue::Currency(v) => json!(v),
                        EseValue::U8(v) => json!(v),
                        EseValue::I16(v) => json!(v),
                        EseValue::I32(v) => json!(v),
                        EseValue::F32(v) => json!(v),
                        EseValue::F64(v) => json!(v),
                        EseValue::Binary(v)
                        | EseValue::LargeBinary(v)
                        | EseValue::SuperLarge(v)
                        | EseValue::Guid(v) => serde_json::to_value(v).unwrap_or_default(),
                        EseValue::Text(v) | EseValue::LargeText(v) => Json::String(v),
                        EseValue::U32(v) => json!(v),
                        EseValue::U16(v) => json!(v),
                        EseValue::Null(_) => Json::Null,
                        _ => Json::String(value.to_string()),
                    };
                    row.insert(column.clone(), value);
                }
                entries.push(Ok(Json::Object(row)));
            }
        }
        // Keep a copy for the analysers, which index back into the tables.
        self.entries = entries
            .iter()
            .filter_map(|e| e.as_ref().ok().cloned())
            .collect();
        entries.into_iter()
    }
}
