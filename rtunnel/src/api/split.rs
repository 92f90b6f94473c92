use crate::api::properties::Properties;

/// A unit of source input, owned by exactly one reader at a time.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SourceSplit {
    split_id: String,
    properties: Properties,
}

impl SourceSplit {
    pub fn new(split_id: &str, properties: Properties) -> Self {
        SourceSplit {
            split_id: split_id.to_string(),
            properties,
        }
    }

    pub fn split_id(&self) -> &str {
        self.split_id.as_str()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}
