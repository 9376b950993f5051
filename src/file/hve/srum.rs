use std::path::Path;

use anyhow::Context;
use notatin::cell_key_node::CellKeyNode;
use notatin::cell_value::CellValue;
use serde_json::json;
use serde_json::Value as Json;

#[derive(Debug)]
pub struct SrumRegInfo {
    pub global_parameters: Json,
    pub extensions: Json,
    pub user_info: Json,
}

fn string_value_from_key(key: &CellKeyNode, value_name: &str) -> crate::Result<Option<String>> {
    let Some(key_value) = key.get_value(value_name) else {
        return Ok(None);
    };
    Ok(match key_value.get_content().0 {
        CellValue::String(s) => Some(s),
        _ => bail!(
            "Value \"{}\" in key \"{}\" was not of type String!",
            value_name,
            key.get_pretty_path()
        ),
    })
}

fn cell_value_to_json(value: CellValue) -> Json {
    match value {
        CellValue::Binary(data) => serde_json::to_value(data).unwrap_or_default(),
        CellValue::U32(data) => json!(data),
        CellValue::U64(data) => json!(data),
        CellValue::I32(data) => json!(data),
        CellValue::I64(data) => json!(data),
        CellValue::String(data) => json!(data),
        CellValue::MultiString(data) => serde_json::to_value(data).unwrap_or_default(),
        CellValue::None | CellValue::Error => Json::Null,
    }
}

impl super::Parser {
    /// Reads the SRUM configuration out of a SOFTWARE hive: the global
    /// retention parameters, the registered extensions and the profile list.
    pub fn parse_srum_entries(&mut self) -> crate::Result<SrumRegInfo> {
        let key_srum_parameters = self
            .inner
            .get_key(
                r"Microsoft\Windows NT\CurrentVersion\SRUM\Parameters",
                false,
            )?
            .ok_or(anyhow!("Could not find the SRUM Parameters registry key!"))?;

        // Default parameters
        let mut global_parameters = json!({
            "Tier1Period": 60,
            "Tier2Period": 3600,
            "Tier2MaxEntries": 1440,
            "Tier2LongTermPeriod": 604800,
            "Tier2LongTermMaxEntries": 260
        });

        for key_value in key_srum_parameters.value_iter() {
            global_parameters[key_value.get_pretty_name()] =
                cell_value_to_json(key_value.get_content().0);
        }

        // Get and parse data related to the SRUM extensions
        let mut key_srum_extensions = self
            .inner
            .get_key(
                r"Microsoft\Windows NT\CurrentVersion\SRUM\Extensions",
                false,
            )?
            .ok_or(anyhow!("Could not find the SRUM Extensions registry key!"))?;

        let mut extensions = json!({});
        let subkeys = key_srum_extensions.read_sub_keys(&mut self.inner);
        for key in subkeys {
            let guid = key.key_name.to_uppercase();
            extensions[&guid] = json!({});
            for key_value in key.value_iter() {
                extensions[&guid][key_value.get_pretty_name()] =
                    cell_value_to_json(key_value.get_content().0);
            }
        }

        // Get Users GUID from the SOFTWARE Registry Hive
        let mut key_profile_list = self
            .inner
            .get_key(r"Microsoft\Windows NT\CurrentVersion\ProfileList", false)?
            .ok_or(anyhow!("Could not find the ProfileList key!"))?;

        let mut user_info = json!({});
        let subkeys = key_profile_list.read_sub_keys(&mut self.inner);
        for key in subkeys {
            let sid = match key.get_value("Sid") {
                Some(key_value) => match key_value.get_content().0 {
                    CellValue::Binary(bytes) => {
                        Json::String(bytes.iter().map(|byte| format!("{:02}", byte)).collect())
                    }
                    _ => Json::Null,
                },
                None => Json::Null,
            };

            let profile_image_path = string_value_from_key(&key, "ProfileImagePath")?
                .with_context(|| format!("Could not get ProfileImagePath for {}", key.key_name))?
                // to get the username afterwards using file_name()
                .replace('\\', "//");

            let username = match Path::new(&profile_image_path).file_name() {
                Some(filename) => Json::String(filename.to_string_lossy().to_string()),
                None => Json::Null,
            };

            let guid = key.key_name;
            let entry = json!({
                "GUID": &guid,
                "SID": sid,
                "Username": username,
            });
            user_info[&guid] = entry;
        }

        Ok(SrumRegInfo {
            global_parameters,
            extensions,
            user_info,
        })
    }
}
