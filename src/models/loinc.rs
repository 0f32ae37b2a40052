use serde::{Deserialize, Serialize};

/// `AllowedValues` comes straight off the LOINC dictionary row: either the
/// literal token `"NUM"`, a serialized list of strings, or absent (accept
/// anything).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AllowedValues {
    Numeric,
    List(Vec<String>),
}

impl AllowedValues {
    /// Parse the raw `AllowedValues` column. `None` means the column was NULL.
    pub fn parse(raw: &str) -> Self {
        if raw == "NUM" {
            AllowedValues::Numeric
        } else {
            match serde_json::from_str::<Vec<String>>(raw) {
                Ok(list) => AllowedValues::List(list),
                Err(_) => AllowedValues::List(raw.split(',').map(|s| s.trim().to_string()).collect()),
            }
        }
    }

    pub fn serialize(&self) -> String {
        match self {
            AllowedValues::Numeric => "NUM".to_string(),
            AllowedValues::List(items) => serde_json::to_string(items).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoincEntry {
    pub loinc_num: String,
    pub component: String,
    pub property: String,
    pub time_aspect: String,
    pub system: String,
    pub scale_type: String,
    pub method_type: String,
    pub allowed_values: Option<AllowedValues>,
}
