use std::fs::File;
use std::path::Path;

use evtx::{EvtxParser, ParserSettings, SerializedEvtxRecord, err::EvtxError};
use serde_json::Value as Json;

use crate::tau::{Document, Value as Tau};
use crate::value::Value;

pub type Evtx = SerializedEvtxRecord<Json>;

pub struct Parser {
    pub inner: EvtxParser<File>,
}

impl Parser {
    pub fn load(file: &Path) -> crate::Result<Self> {
        let settings = ParserSettings::default()
            .separate_json_attributes(true)
            .num_threads(0);
        let parser = EvtxParser::from_path(file)?.with_configuration(settings);
        Ok(Self { inner: parser })
    }

    pub fn parse(
        &mut self,
    ) -> impl Iterator<Item = Result<SerializedEvtxRecord<Json>, EvtxError>> + '_ {
        self.inner.records_json_value()
    }
}

/// Event logs store some values in attribute objects, this wrapper aliases
/// the common logical locations onto them.
pub struct Wrapper<'a>(pub &'a Value);

impl Document for Wrapper<'_> {
    fn find(&self, key: &str) -> Option<Tau<'_>> {
        let value = match key {
            "Event.System.EventID" => self
                .0
                .find("Event.System.EventID.#text")
                .or_else(|| self.0.find(key)),
            "Event.System.Provider" => self.0.find("Event.System.Provider_attributes.Name"),
            "Event.System.TimeCreated" => self
                .0
                .find("Event.System.TimeCreated_attributes.SystemTime"),
            _ => self.0.find(key),
        };
        value.map(Into::into)
    }

    fn as_text(&self) -> Option<String> {
        serde_json::to_string(self.0).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_aliases_attributes() {
        let value: Value = serde_json::from_str(
            r#"{
                "Event": {
                    "System": {
                        "EventID": 4624,
                        "Provider_attributes": {"Name": "Security"},
                        "TimeCreated_attributes": {"SystemTime": "2024-01-01T00:00:00.000000Z"}
                    }
                }
            }"#,
        )
        .unwrap();
        let wrapper = Wrapper(&value);
        assert!(matches!(
            wrapper.find("Event.System.EventID"),
            Some(Tau::UInt(4624))
        ));
        assert_eq!(
            wrapper.find("Event.System.Provider").and_then(|v| v.to_display()),
            Some("Security".to_owned())
        );
        assert_eq!(
            wrapper
                .find("Event.System.TimeCreated")
                .and_then(|v| v.to_display()),
            Some("2024-01-01T00:00:00.000000Z".to_owned())
        );
    }
}
