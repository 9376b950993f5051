use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use self::esedb::{Esedb, Parser as EsedbParser};
use self::evtx::{Evtx, Parser as EvtxParser};
use self::hve::{Hve, Parser as HveParser};
use self::json::{Json, Parser as JsonParser, lines::Parser as JsonlParser};
use self::mft::{Mft, Parser as MftParser};
use self::xml::{Parser as XmlParser, Xml};

pub mod esedb;
pub mod evtx;
pub mod hve;
pub mod json;
pub mod mft;
pub mod xml;

#[derive(Clone)]
pub enum Document {
    Evtx(Evtx),
    Hve(Hve),
    Json(Json),
    Mft(Mft),
    Xml(Xml),
    Esedb(Esedb),
}

pub struct Documents<'a> {
    iterator: Box<dyn Iterator<Item = crate::Result<Document>> + Send + 'a>,
}

impl Iterator for Documents<'_> {
    type Item = crate::Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iterator.next()
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, Hash, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Evtx,
    Hve,
    Json,
    Jsonl,
    Mft,
    Xml,
    Esedb,
    Unknown,
}

impl Kind {
    pub fn extensions(&self) -> Option<Vec<String>> {
        match self {
            Kind::Evtx => Some(vec!["evt".to_string(), "evtx".to_string()]),
            Kind::Hve => Some(vec!["hve".to_string()]),
            Kind::Json => Some(vec!["json".to_string()]),
            Kind::Jsonl => Some(vec!["jsonl".to_string()]),
            Kind::Mft => Some(vec![
                "mft".to_string(),
                "bin".to_string(),
                "$MFT".to_string(),
            ]),
            Kind::Xml => Some(vec!["xml".to_string()]),
            Kind::Esedb => Some(vec!["dat".to_string(), "edb".to_string()]),
            Kind::Unknown => None,
        }
    }
}

/// Every extension any backend claims, the discovery set used by `search`
/// and `dump`.
pub fn known_extensions() -> HashSet<String> {
    let mut extensions = HashSet::new();
    for kind in [
        Kind::Evtx,
        Kind::Hve,
        Kind::Json,
        Kind::Jsonl,
        Kind::Mft,
        Kind::Xml,
        Kind::Esedb,
    ] {
        if let Some(e) = kind.extensions() {
            extensions.extend(e);
        }
    }
    extensions
}

pub struct Unknown;
impl Iterator for Unknown {
    type Item = crate::Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        None
    }
}

#[allow(clippy::large_enum_variant)]
pub enum Parser {
    Evtx(EvtxParser),
    Hve(HveParser),
    Json(JsonParser),
    Jsonl(JsonlParser),
    Mft(MftParser),
    Xml(XmlParser),
    Esedb(EsedbParser),
    Unknown,
}

pub struct Reader {
    parser: Parser,
}

impl Reader {
    pub fn load(file: &Path, load_unknown: bool, skip_errors: bool) -> crate::Result<Self> {
        // NOTE: We don't want to use libmagic because then we have to include
        // databases etc... So for now we assume that the file extensions are
        // correct!
        fn failed(file: &Path, error: anyhow::Error, skip_errors: bool) -> crate::Result<Reader> {
            if skip_errors {
                cs_eyellowln!("[!] failed to load file '{}' - {}", file.display(), error);
                Ok(Reader {
                    parser: Parser::Unknown,
                })
            } else {
                Err(error)
            }
        }
        let extension = file
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());
        match extension.as_deref() {
            Some("evt") | Some("evtx") => match EvtxParser::load(file) {
                Ok(parser) => Ok(Self {
                    parser: Parser::Evtx(parser),
                }),
                Err(e) => failed(file, e, skip_errors),
            },
            Some("json") => match JsonParser::load(file) {
                Ok(parser) => Ok(Self {
                    parser: Parser::Json(parser),
                }),
                Err(e) => failed(file, e, skip_errors),
            },
            Some("jsonl") => match JsonlParser::load(file) {
                Ok(parser) => Ok(Self {
                    parser: Parser::Jsonl(parser),
                }),
                Err(e) => failed(file, e, skip_errors),
            },
            Some("bin") | Some("mft") => match MftParser::load(file) {
                Ok(parser) => Ok(Self {
                    parser: Parser::Mft(parser),
                }),
                Err(e) => failed(file, e, skip_errors),
            },
            Some("xml") => match XmlParser::load(file) {
                Ok(parser) => Ok(Self {
                    parser: Parser::Xml(parser),
                }),
                Err(e) => failed(file, e, skip_errors),
            },
            Some("hve") => match HveParser::load(file) {
                Ok(parser) => Ok(Self {
                    parser: Parser::Hve(parser),
                }),
                Err(e) => failed(file, e, skip_errors),
            },
            Some("dat") | Some("edb") => match EsedbParser::load(file) {
                Ok(parser) => Ok(Self {
                    parser: Parser::Esedb(parser),
                }),
                Err(e) => failed(file, e, skip_errors),
            },
            _ => {
                // Edge cases
                if file.file_name().and_then(|e| e.to_str()) == Some("$MFT") {
                    if let Ok(parser) = MftParser::load(file) {
                        return Ok(Self {
                            parser: Parser::Mft(parser),
                        });
                    }
                }
                if load_unknown {
                    if let Ok(parser) = EvtxParser::load(file) {
                        return Ok(Self {
                            parser: Parser::Evtx(parser),
                        });
                    } else if let Ok(parser) = MftParser::load(file) {
                        return Ok(Self {
                            parser: Parser::Mft(parser),
                        });
                    } else if let Ok(parser) = JsonParser::load(file) {
                        return Ok(Self {
                            parser: Parser::Json(parser),
                        });
                    } else if let Ok(parser) = XmlParser::load(file) {
                        return Ok(Self {
                            parser: Parser::Xml(parser),
                        });
                    } else if let Ok(parser) = HveParser::load(file) {
                        return Ok(Self {
                            parser: Parser::Hve(parser),
                        });
                    } else if let Ok(parser) = EsedbParser::load(file) {
                        return Ok(Self {
                            parser: Parser::Esedb(parser),
                        });
                    }
                    failed(
                        file,
                        anyhow!("file type is not known - {}", file.display()),
                        skip_errors,
                    )
                } else {
                    failed(
                        file,
                        anyhow!(
                            "file type is not currently supported - {}, use --load-unknown to force it",
                            file.display()
                        ),
                        skip_errors,
                    )
                }
            }
        }
    }

    pub fn documents<'a>(&'a mut self) -> Documents<'a> {
        let iterator = match &mut self.parser {
            Parser::Evtx(parser) => Box::new(
                parser
                    .parse()
                    .map(|r| r.map(Document::Evtx).map_err(|e| e.into())),
            )
                as Box<dyn Iterator<Item = crate::Result<Document>> + Send + 'a>,
            Parser::Hve(parser) => Box::new(parser.parse().map(|r| r.map(Document::Hve)))
                as Box<dyn Iterator<Item = crate::Result<Document>> + Send + 'a>,
            Parser::Json(parser) => Box::new(parser.parse().map(|r| r.map(Document::Json)))
                as Box<dyn Iterator<Item = crate::Result<Document>> + Send + 'a>,
            Parser::Jsonl(parser) => Box::new(parser.parse().map(|r| r.map(Document::Json)))
                as Box<dyn Iterator<Item = crate::Result<Document>> + Send + 'a>,
            Parser::Mft(parser) => Box::new(parser.parse().map(|r| r.map(Document::Mft)))
                as Box<dyn Iterator<Item = crate::Result<Document>> + Send + 'a>,
            Parser::Xml(parser) => Box::new(parser.parse().map(|r| r.map(Document::Xml)))
                as Box<dyn Iterator<Item = crate::Result<Document>> + Send + 'a>,
            Parser::Esedb(parser) => Box::new(parser.parse().map(|r| r.map(Document::Esedb)))
                as Box<dyn Iterator<Item = crate::Result<Document>> + Send + 'a>,
            Parser::Unknown => {
                Box::new(Unknown) as Box<dyn Iterator<Item = crate::Result<Document>> + Send + 'a>
            }
        };
        Documents { iterator }
    }

    pub fn kind(&self) -> Kind {
        match self.parser {
            Parser::Evtx(_) => Kind::Evtx,
            Parser::Hve(_) => Kind::Hve,
            Parser::Json(_) => Kind::Json,
            Parser::Jsonl(_) => Kind::Jsonl,
            Parser::Mft(_) => Kind::Mft,
            Parser::Xml(_) => Kind::Xml,
            Parser::Esedb(_) => Kind::Esedb,
            Parser::Unknown => Kind::Unknown,
        }
    }
}

/// Walks a path collecting files that pass the extension gate. Entries are
/// visited in lexicographic order at each level so discovery is
/// deterministic; symlinks are only followed while they resolve inside the
/// walked root.
pub fn get_files(
    path: &PathBuf,
    extensions: &Option<HashSet<String>>,
    skip_errors: bool,
) -> crate::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = vec![];
    if !path.exists() {
        if skip_errors {
            cs_eyellowln!("[!] Specified path does not exist - {}", path.display());
            return Ok(files);
        }
        anyhow::bail!("Specified path is invalid - {}", path.display());
    }
    let root = match fs::canonicalize(path) {
        Ok(root) => root,
        Err(e) => {
            if skip_errors {
                cs_eyellowln!("[!] failed to canonicalise path - {}", e);
                return Ok(files);
            }
            anyhow::bail!(e);
        }
    };
    let mut visited = HashSet::new();
    walk(path, &root, extensions, skip_errors, &mut visited, &mut files)?;
    Ok(files)
}

fn walk(
    path: &Path,
    root: &Path,
    extensions: &Option<HashSet<String>>,
    skip_errors: bool,
    visited: &mut HashSet<PathBuf>,
    files: &mut Vec<PathBuf>,
) -> crate::Result<()> {
    let symlink = fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    let canonical = match fs::canonicalize(path) {
        Ok(canonical) => canonical,
        Err(e) => {
            if skip_errors {
                cs_eyellowln!("[!] failed to get metadata for file - {}", e);
                return Ok(());
            }
            anyhow::bail!(e);
        }
    };
    if symlink && !canonical.starts_with(root) {
        cs_eyellowln!(
            "[!] skipping symlink that leaves the search root - {}",
            path.display()
        );
        return Ok(());
    }
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            if skip_errors {
                cs_eyellowln!("[!] failed to get metadata for file - {}", e);
                return Ok(());
            }
            anyhow::bail!(e);
        }
    };
    if metadata.is_dir() {
        if !visited.insert(canonical) {
            // A symlink loop, we have walked this directory already.
            return Ok(());
        }
        let directory = match path.read_dir() {
            Ok(directory) => directory,
            Err(e) => {
                if skip_errors {
                    cs_eyellowln!("[!] failed to read directory - {}", e);
                    return Ok(());
                }
                anyhow::bail!(e);
            }
        };
        let mut entries = vec![];
        for entry in directory {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if skip_errors {
                        cs_eyellowln!("[!] failed to enter directory - {}", e);
                        continue;
                    }
                    anyhow::bail!(e);
                }
            };
            entries.push(entry.path());
        }
        entries.sort();
        for entry in entries {
            walk(&entry, root, extensions, skip_errors, visited, files)?;
        }
    } else if let Some(e) = extensions {
        if let Some(extension) = path.extension() {
            if e.contains(&extension.to_string_lossy().to_lowercase()) {
                files.push(path.to_path_buf());
            }
        }
        // Edge cases
        if e.contains("$MFT") && path.file_name().and_then(|e| e.to_str()) == Some("$MFT") {
            files.push(path.to_path_buf());
        }
    } else {
        files.push(path.to_path_buf());
    }
    Ok(())
}

pub fn win32_ts_to_datetime(ts_win32: u64) -> crate::Result<DateTime<Utc>> {
    let ts_unix = (ts_win32 / 10_000) as i64 - 11644473600000;
    DateTime::from_timestamp_millis(ts_unix).ok_or(anyhow!("Timestamp out of range!"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn discovery_is_sorted_and_filtered() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("b")).unwrap();
        for name in ["b/zz.json", "b/aa.json", "top.json", "skip.txt"] {
            let mut file = File::create(root.path().join(name)).unwrap();
            file.write_all(b"{}").unwrap();
        }
        let extensions = Some(HashSet::from(["json".to_string()]));
        let files = get_files(&root.path().to_path_buf(), &extensions, false).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| {
                f.strip_prefix(root.path())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        assert_eq!(names, vec!["b/aa.json", "b/zz.json", "top.json"]);
    }

    #[test]
    fn discovery_extension_gate_is_case_insensitive() {
        let root = tempfile::tempdir().unwrap();
        let mut file = File::create(root.path().join("UPPER.JSON")).unwrap();
        file.write_all(b"{}").unwrap();
        let extensions = Some(HashSet::from(["json".to_string()]));
        let files = get_files(&root.path().to_path_buf(), &extensions, false).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn discovery_missing_path_errors() {
        let path = PathBuf::from("/definitely/not/here");
        assert!(get_files(&path, &None, false).is_err());
        assert!(get_files(&path, &None, true).unwrap().is_empty());
    }
}
