// The SRUM (System Resource Usage Monitor) tracks programs, services,
// Windows apps and network connectivity. The providers and parameters are
// registered under HKLM\SOFTWARE\Microsoft\Windows NT\CurrentVersion\SRUM\
// and the data lives in an ESE database, by default at
// %SystemRoot%\System32\sru\SRUDB.dat.
use std::collections::BTreeMap;
use std::{fs, path::PathBuf};

use anyhow::Context;
use prettytable::{Cell, Row, Table, cell, row};
use serde_json::json;
use serde_json::Value as Json;

use crate::file::esedb::Parser as EsedbParser;
use crate::file::hve::{Parser as HveParser, srum::SrumRegInfo};

pub struct SrumDbInfo {
    pub table_details: Table,
    pub db_content: Json,
}

pub struct SrumAnalyser {
    srum_path: PathBuf,
    software_hive_path: PathBuf,
}

/// Convert a binary blob to an SID string
pub fn bytes_to_sid_string(hex: &[u8]) -> Option<String> {
    if hex.len() <= 8 {
        return None;
    }

    let sid_version = hex[0].to_string();
    let auth_id = i32::from_le_bytes([hex[7], hex[6], hex[5], hex[4]]);
    let mut sid = format!("S-{}-{}", sid_version, auth_id);

    for chunk in hex[8..].chunks(4) {
        if chunk.len() < 4 {
            return None;
        }
        let sub_auth = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        sid = format!("{}-{}", sid, sub_auth);
    }
    Some(sid)
}

fn format_duration(days: f64) -> String {
    let whole_days = days.trunc() as u64;
    let hours = ((days - whole_days as f64) * 24.0).round();
    let whole_hours = hours.trunc() as u64;
    let minutes = ((hours - whole_hours as f64) * 60.0).round() as u64;

    let mut result: Vec<String> = Vec::new();
    if whole_days > 0 {
        result.push(format!("{} days", whole_days));
    }
    if whole_hours > 0 {
        result.push(format!("{} hours", whole_hours));
    }
    if minutes > 0 {
        result.push(format!("{} minutes", minutes));
    }
    result.join(", ")
}

impl SrumAnalyser {
    pub fn new(srum_path: PathBuf, software_hive_path: PathBuf) -> Self {
        Self {
            srum_path,
            software_hive_path,
        }
    }

    pub fn parse_srum_database(&self) -> crate::Result<SrumDbInfo> {
        let mut esedb_parser = EsedbParser::load(&self.srum_path)
            .with_context(|| "unable to load the ESE database")?;
        cs_eprintln!(
            "[+] SRUM database loaded from {:?}",
            fs::canonicalize(&self.srum_path).expect("could not get absolute path")
        );
        cs_eprintln!("[+] Parsing the SRUM database...");
        for entry in esedb_parser.parse() {
            if let Err(e) = entry {
                cs_eyellowln!("[!] failed to parse an ESE database record - {}", e);
            }
        }

        let mut registry_parser = HveParser::load(&self.software_hive_path)
            .with_context(|| "unable to load the SOFTWARE hive")?;
        cs_eprintln!(
            "[+] SOFTWARE hive loaded from {:?}",
            fs::canonicalize(&self.software_hive_path).expect("could not get absolute path")
        );
        cs_eprintln!("[+] Parsing the SOFTWARE registry hive...");
        let srum_reg_info: SrumRegInfo = registry_parser
            .parse_srum_entries()
            .with_context(|| "unable to parse the SRUM registry information")?;

        let id_map = esedb_parser
            .parse_sru_db_id_map_table()
            .with_context(|| "unable to parse the SruDbIdMapTable")?;

        let parameters = srum_reg_info
            .global_parameters
            .as_object()
            .with_context(|| "the SRUM parameters should be a JSON object")?;
        let extensions = srum_reg_info
            .extensions
            .as_object()
            .with_context(|| "the SRUM extensions should be a JSON object")?;

        // Index the records per table, resolving the identifiers the SRUM
        // tables share through SruDbIdMapTable.
        let mut tables: BTreeMap<String, Vec<Json>> = BTreeMap::new();
        for entry in &esedb_parser.entries {
            let table = match entry.get("Table").and_then(|t| t.as_str()) {
                Some(table) => table.to_uppercase(),
                None => continue,
            };
            if table == "SRUDBIDMAPTABLE" {
                continue;
            }
            let mut record = entry.clone();
            if let Some(record) = record.as_object_mut() {
                record.remove("Table");
                if let Some(app_id) = record.get("AppId").cloned() {
                    if let Some(resolved) = id_map
                        .get(&app_id.to_string())
                        .and_then(|e| e.id_blob_as_string.clone())
                    {
                        record.insert("AppInfo".to_string(), Json::String(resolved));
                    }
                }
                if let Some(user_id) = record.get("UserId").cloned() {
                    if let Some(sid) = id_map
                        .get(&user_id.to_string())
                        .and_then(|e| e.id_blob.as_ref())
                        .and_then(|blob| bytes_to_sid_string(blob))
                    {
                        record.insert("UserSid".to_string(), Json::String(sid));
                    }
                }
            }
            tables.entry(table).or_default().push(record);
        }

        // Collate the per-extension details advertised by the registry.
        let mut table_details = Table::new();
        table_details.add_row(row![
            "Table GUID",
            "Table Name",
            "DLL Path",
            "Record Count",
            "Retention Period"
        ]);
        for (guid, extension) in extensions {
            let table_name = extension
                .get("(default)")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let dll_path = extension
                .get("DllName")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let records = tables.get(&guid.to_uppercase()).map(|t| t.len()).unwrap_or(0);
            let retention = if extension.get("LastLongTermUpdate").is_some() {
                let period = extension
                    .get("Tier2LongTermPeriod")
                    .or_else(|| parameters.get("Tier2LongTermPeriod"))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(604800.0);
                let entries = extension
                    .get("Tier2LongTermMaxEntries")
                    .or_else(|| parameters.get("Tier2LongTermMaxEntries"))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(260.0);
                format_duration(period * entries / 86400.0)
            } else {
                let period = parameters
                    .get("Tier2Period")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(3600.0);
                let entries = parameters
                    .get("Tier2MaxEntries")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(1440.0);
                format_duration(period * entries / 86400.0)
            };
            table_details.add_row(Row::new(vec![
                Cell::new(guid),
                Cell::new(table_name),
                Cell::new(dll_path),
                cell!(records.to_string()),
                Cell::new(&retention),
            ]));
        }

        let db_content = json!({
            "parameters": srum_reg_info.global_parameters,
            "user_info": srum_reg_info.user_info,
            "tables": serde_json::to_value(tables)
                .with_context(|| "unexpected JSON serialisation error")?,
        });

        Ok(SrumDbInfo {
            table_details,
            db_content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_conversion() {
        // S-1-5-18, the local system SID
        let bytes = [
            0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x12, 0x00, 0x00, 0x00,
        ];
        assert_eq!(bytes_to_sid_string(&bytes), Some("S-1-5-18".to_owned()));
        assert_eq!(bytes_to_sid_string(&[0x01]), None);
    }

    #[test]
    fn durations_are_humanised() {
        assert_eq!(format_duration(60.0), "60 days");
        assert_eq!(format_duration(1.5), "1 days, 12 hours");
    }
}
