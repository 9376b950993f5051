use std::path::Path;
use std::{fs::File, io::BufReader};

use mft::csv::FlatMftEntryWithName;
use mft::{MftEntry, MftParser};
use serde_json::Value as Json;

pub type Mft = Json;

pub struct Parser {
    pub inner: MftParser<BufReader<File>>,
}

impl Parser {
    pub fn load(file: &Path) -> crate::Result<Self> {
        let parser = MftParser::from_path(file)?;
        Ok(Self { inner: parser })
    }

    pub fn parse(&mut self) -> impl Iterator<Item = crate::Result<Json>> + '_ {
        // The parsing library needs the parser to resolve entry names, so we
        // have to collect the entries up front.
        let entries: Vec<Result<MftEntry, mft::err::Error>> = self.inner.iter_entries().collect();
        let mut json = vec![];
        for entry in entries {
            json.push(match entry {
                Ok(e) => {
                    let flat = FlatMftEntryWithName::from_entry(&e, &mut self.inner);
                    serde_json::to_value(flat).map_err(|e| anyhow!(e))
                }
                Err(e) => Err(anyhow!(e)),
            });
        }
        json.into_iter()
    }
}
