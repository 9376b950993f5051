use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[allow(dead_code)]
enum InsertFlag {
    Unknown1 = 0x00000001,
    Executed = 0x00000002,
}

#[derive(Debug, Serialize)]
pub struct ShimcacheEntry {
    pub cache_entry_position: u32,
    pub controlset: u32,
    pub data_size: Option<usize>,
    pub entry_type: EntryType,
    pub executed: Option<bool>,
    pub last_modified_ts: Option<DateTime<Utc>>,
    pub path_size: usize,
    pub signature: Option<String>,
}

#[derive(Debug, Serialize)]
pub enum EntryType {
    File {
        path: String,
    },
    Program {
        raw_entry: String,
        program_name: String,
        program_version: String,
        publisher_id: String,
    },
}

#[derive(Debug)]
pub enum ShimcacheVersion {
    Unknown,
    Windows10,
    Windows10Creators,
    Windows7x64Windows2008R2,
}

impl Display for ShimcacheVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Windows10 => write!(f, "Windows 10"),
            Self::Windows10Creators => write!(f, "Windows 10 Creators"),
            Self::Windows7x64Windows2008R2 => {
                write!(f, "Windows 7 64-bit or Windows Server 2008 R2")
            }
        }
    }
}

#[derive(Debug)]
pub struct ShimcacheArtefact {
    pub entries: Vec<ShimcacheEntry>,
    pub last_update_ts: DateTime<Utc>,
    pub version: ShimcacheVersion,
}

impl Display for ShimcacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path_or_name = match &self.entry_type {
            EntryType::File { path } => path,
            EntryType::Program { program_name, .. } => program_name,
        };
        match self.last_modified_ts {
            Some(ts) => write!(
                f,
                "{}:\t{:?}, {}",
                self.cache_entry_position, ts, path_or_name
            ),
            None => write!(f, "{}:\t {}", self.cache_entry_position, path_or_name),
        }
    }
}

impl super::Parser {
    pub fn parse_shimcache(&mut self) -> crate::Result<ShimcacheArtefact> {
        // Find current ControlSet
        let current_controlset_key = self
            .inner
            .get_key("Select", false)?
            .ok_or(anyhow!("Key \"Select\" not found in shimcache!"))?;
        let current_controlset_value = current_controlset_key
            .get_value("Current")
            .ok_or(anyhow!(
                "Value \"Current\" not found under key \"Select\" in shimcache!"
            ))?
            .get_content()
            .0;
        let controlset = match current_controlset_value {
            notatin::cell_value::CellValue::U32(num) => num,
            _ => bail!("Value \"Current\" under key \"Select\" was not of type U32 in shimcache!"),
        };

        // Load shimcache binary data
        let controlset_name = format!("ControlSet{:0>3}", controlset);
        let shimcache_key_path =
            format!("{controlset_name}\\Control\\Session Manager\\AppCompatCache");
        let shimcache_key = self
            .inner
            .get_key(&shimcache_key_path, false)?
            .ok_or(anyhow!(
                "Could not find AppCompatCache with path {}!",
                shimcache_key_path
            ))?;
        let shimcache_last_update_ts = shimcache_key.last_key_written_date_and_time();
        let shimcache_cell_value = shimcache_key
            .get_value("AppCompatCache")
            .ok_or(anyhow!(
                "Value \"AppCompatCache\" not found under key \"{}\"!",
                shimcache_key_path
            ))?
            .get_content()
            .0;
        let shimcache_bytes = match shimcache_cell_value {
            notatin::cell_value::CellValue::Binary(bytes) => bytes,
            _ => bail!("Shimcache value was not of type Binary!"),
        };

        // Find shimcache version
        let e = || anyhow!("Shimcache byte indexing error!");
        let signature_number =
            u32::from_le_bytes(shimcache_bytes.get(0..4).ok_or_else(e)?.try_into()?);

        let shimcache_version = match signature_number {
            // Windows 7 shimcache
            0xbadc0fee => ShimcacheVersion::Windows7x64Windows2008R2,
            _ => {
                let offset_to_records = signature_number as usize;
                let win10_cache_signature = std::str::from_utf8(
                    shimcache_bytes
                        .get(offset_to_records..offset_to_records + 4)
                        .ok_or_else(e)?,
                );
                match win10_cache_signature {
                    Ok("10ts") => match offset_to_records {
                        0x34 => ShimcacheVersion::Windows10Creators,
                        _ => ShimcacheVersion::Windows10,
                    },
                    _ => ShimcacheVersion::Unknown,
                }
            }
        };

        // Parse shimcache entries
        let shimcache_entries = match shimcache_version {
            ShimcacheVersion::Unknown => {
                bail!("Could not recognize shimcache version!")
            }
            ShimcacheVersion::Windows10 | ShimcacheVersion::Windows10Creators => {
                windows_10_cache::parse(&shimcache_bytes, controlset)
            }
            ShimcacheVersion::Windows7x64Windows2008R2 => {
                windows_7_x64_cache::parse(&shimcache_bytes, controlset)
            }
        }
        .map_err(|e| {
            anyhow!(
                "Failed to parse {} shimcache data. Error: {}",
                shimcache_version,
                e
            )
        })?;

        Ok(ShimcacheArtefact {
            entries: shimcache_entries,
            last_update_ts: shimcache_last_update_ts,
            version: shimcache_version,
        })
    }
}

/// Converts a slice of bytes representing UTF-16 into a String
fn utf16_to_string(bytes: &[u8]) -> crate::Result<String> {
    let chunks = bytes.chunks_exact(2);
    if !chunks.remainder().is_empty() {
        bail!("Bytes did not align to 16 bits!");
    }
    let words: Vec<u16> = chunks
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16(&words)?)
}

mod windows_10_cache {
    use super::{EntryType, ShimcacheEntry, utf16_to_string};

    use lazy_static::lazy_static;
    use regex::Regex;

    use crate::file::win32_ts_to_datetime;

    pub fn parse(shimcache_bytes: &[u8], controlset: u32) -> crate::Result<Vec<ShimcacheEntry>> {
        let mut shimcache_entries: Vec<ShimcacheEntry> = Vec::new();
        let mut index = u32::from_le_bytes(
            shimcache_bytes
                .get(0..4)
                .ok_or(anyhow!("could not get offset to records"))?
                .try_into()?,
        ) as usize;
        let mut cache_entry_position = 0;
        while index < shimcache_bytes.len() {
            let e = || {
                anyhow!(
                    "Error parsing windows 10 shimcache entry. Position: {}",
                    cache_entry_position
                )
            };
            let signature =
                std::str::from_utf8(shimcache_bytes.get(index..index + 4).ok_or_else(e)?)?
                    .to_string();
            if signature != "10ts" {
                break;
            }
            index += 4;
            // skip 4 unknown
            index += 4;
            let _cache_entry_size = u32::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 4)
                    .ok_or_else(e)?
                    .try_into()?,
            );
            index += 4;
            let path_size = u16::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 2)
                    .ok_or_else(e)?
                    .try_into()?,
            ) as usize;
            index += 2;
            let path = utf16_to_string(
                shimcache_bytes
                    .get(index..index + path_size)
                    .ok_or_else(e)?,
            )?;
            index += path_size;
            let last_modified_time_utc_win32 = u64::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 8)
                    .ok_or_else(e)?
                    .try_into()?,
            );
            index += 8;
            let data_size = u32::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 4)
                    .ok_or_else(e)?
                    .try_into()?,
            ) as usize;
            index += 4;
            shimcache_bytes.get(index..index + data_size).ok_or_else(e)?;
            index += data_size;

            // Program entries encode their identity in the path field
            lazy_static! {
                static ref PROGRAM_RE: Regex = Regex::new(
                    r"^([0-9a-f]{8})\s+([0-9a-f]{16})\s+([0-9a-f]{16})\s+([0-9a-f]{4})\s+([\w.-]+)\s+(\w+)\s*(\w*)$"
                ).expect("invalid regex");
            }
            let entry_type = match PROGRAM_RE.captures(&path) {
                Some(capture) => {
                    fn parse_version_hex(hex: &str) -> crate::Result<String> {
                        let numbers = [
                            u16::from_str_radix(&hex[0..4], 16)?,
                            u16::from_str_radix(&hex[4..8], 16)?,
                            u16::from_str_radix(&hex[8..12], 16)?,
                            u16::from_str_radix(&hex[12..16], 16)?,
                        ];
                        Ok(numbers.map(|n| n.to_string()).join("."))
                    }
                    let program_version =
                        parse_version_hex(capture.get(2).ok_or_else(e)?.as_str())?;
                    let program_name = capture.get(5).ok_or_else(e)?.as_str().to_string();
                    let publisher_id = capture.get(6).ok_or_else(e)?.as_str().to_string();
                    EntryType::Program {
                        program_name,
                        program_version,
                        publisher_id,
                        raw_entry: path,
                    }
                }
                None => EntryType::File { path },
            };
            let last_modified_ts = if last_modified_time_utc_win32 != 0 {
                Some(win32_ts_to_datetime(last_modified_time_utc_win32)?)
            } else {
                None
            };

            shimcache_entries.push(ShimcacheEntry {
                cache_entry_position,
                data_size: Some(data_size),
                executed: None,
                last_modified_ts,
                entry_type,
                path_size,
                signature: Some(signature),
                controlset,
            });
            cache_entry_position += 1;
        }
        Ok(shimcache_entries)
    }
}

mod windows_7_x64_cache {
    use super::{EntryType, InsertFlag, ShimcacheEntry, utf16_to_string};

    use crate::file::win32_ts_to_datetime;

    pub fn parse(shimcache_bytes: &[u8], controlset: u32) -> crate::Result<Vec<ShimcacheEntry>> {
        let mut shimcache_entries: Vec<ShimcacheEntry> = Vec::new();
        let entry_count = u32::from_le_bytes(
            shimcache_bytes
                .get(4..8)
                .ok_or(anyhow!("could not get entry count"))?
                .try_into()?,
        ) as usize;
        if entry_count == 0 {
            return Ok(shimcache_entries);
        }
        let mut index = 128;
        let mut cache_entry_position = 0;
        while index < shimcache_bytes.len() {
            let e = || {
                anyhow!(
                    "Error parsing windows 7 shimcache entry. Position: {}",
                    cache_entry_position
                )
            };
            let path_size = u16::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 2)
                    .ok_or_else(e)?
                    .try_into()?,
            ) as usize;
            index += 2;
            let _max_path_size = u16::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 2)
                    .ok_or_else(e)?
                    .try_into()?,
            ) as usize;
            index += 2;
            // skip 4 unknown (padding)
            index += 4;
            let path_offset = u64::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 8)
                    .ok_or_else(e)?
                    .try_into()?,
            ) as usize;
            index += 8;
            let last_modified_time_utc_win32 = u64::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 8)
                    .ok_or_else(e)?
                    .try_into()?,
            );
            index += 8;
            let insert_flags = u32::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 4)
                    .ok_or_else(e)?
                    .try_into()?,
            );
            index += 4;
            // skip 4 (shim flags)
            index += 4;
            let data_size = u64::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 8)
                    .ok_or_else(e)?
                    .try_into()?,
            ) as usize;
            index += 8;
            let _data_offset = u64::from_le_bytes(
                shimcache_bytes
                    .get(index..index + 8)
                    .ok_or_else(e)?
                    .try_into()?,
            ) as usize;
            index += 8;

            let path = utf16_to_string(
                shimcache_bytes
                    .get(path_offset..path_offset + path_size)
                    .ok_or_else(e)?,
            )?
            .replace(r"\??\", "");
            let last_modified_ts = if last_modified_time_utc_win32 != 0 {
                Some(win32_ts_to_datetime(last_modified_time_utc_win32)?)
            } else {
                None
            };
            let executed =
                Some(insert_flags & InsertFlag::Executed as u32 == InsertFlag::Executed as u32);

            shimcache_entries.push(ShimcacheEntry {
                cache_entry_position,
                data_size: Some(data_size),
                executed,
                last_modified_ts,
                entry_type: EntryType::File { path },
                path_size,
                signature: None,
                controlset,
            });
            if shimcache_entries.len() >= entry_count {
                break;
            }
            cache_entry_position += 1;
        }
        Ok(shimcache_entries)
    }
}
