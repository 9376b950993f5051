use std::collections::HashMap;

use anyhow::Context;

#[derive(Debug)]
pub struct SruDbIdMapTableEntry {
    pub id_type: i8,
    pub id_index: i32,
    pub id_blob: Option<Vec<u8>>,
    pub id_blob_as_string: Option<String>,
}

impl super::Parser {
    /// Parses the SruDbIdMapTable, which maps the numeric identifiers the
    /// other SRUM tables use onto application paths and user SIDs.
    pub fn parse_sru_db_id_map_table(
        &self,
    ) -> crate::Result<HashMap<String, SruDbIdMapTableEntry>> {
        let table_entries = self.entries.iter().filter(|entry| {
            entry
                .get("Table")
                .and_then(|v| v.as_str())
                .is_some_and(|name| name == "SruDbIdMapTable")
        });

        let mut mapped_table_entries = HashMap::new();

        for table_entry in table_entries {
            let id_blob: Option<Vec<u8>> = match table_entry.get("IdBlob") {
                Some(blob) if !blob.is_null() => Some(
                    serde_json::from_value(blob.clone())
                        .with_context(|| "unable to get IdBlob from SruDbIdMapTable")?,
                ),
                _ => None,
            };

            let mut entry = SruDbIdMapTableEntry {
                id_type: serde_json::from_value(
                    table_entry.get("IdType").cloned().unwrap_or_default(),
                )
                .with_context(|| "unable to get IdType from SruDbIdMapTable")?,
                id_index: serde_json::from_value(
                    table_entry.get("IdIndex").cloned().unwrap_or_default(),
                )
                .with_context(|| "unable to get IdIndex from SruDbIdMapTable")?,
                id_blob,
                id_blob_as_string: None,
            };

            // Anything that is not a Windows SID is a UTF-16 string.
            if entry.id_type != 3 {
                if let Some(id_blob) = &entry.id_blob {
                    let s = String::from_utf8_lossy(id_blob).replace('\u{0000}', "");
                    entry.id_blob_as_string = Some(s);
                }
            }

            mapped_table_entries.insert(entry.id_index.to_string(), entry);
        }
        Ok(mapped_table_entries)
    }
}
