use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parameter holding the datasource a dataset was collected from.
pub const PARAM_DATASOURCE: &str = "datasource";
/// Parameter that exempts a dataset from its datasource's expiration timeout.
pub const PARAM_KEEP: &str = "keep";

/// A stored dataset: the unit of data that jobs collect and transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub key: String,
    /// Key of the dataset this one was derived from; `None` at top level.
    pub key_parent: Option<String>,
    /// The datasource search or processor type that produces this dataset.
    pub dataset_type: String,
    pub owner: String,
    /// Ordered configuration of the dataset.
    pub parameters: Map<String, Value>,
    /// Creation time, unix seconds.
    pub timestamp: i64,
    /// Absolute expiry overriding any datasource timeout.
    pub expires_after: Option<i64>,
    pub status: String,
    /// Number of result items; -1 until the dataset is finished.
    pub num_rows: i64,
    pub is_finished: bool,
    /// File name of the result artifact inside the results directory.
    pub result_file: String,
    pub software_version: String,
}

impl Dataset {
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn datasource(&self) -> Option<&str> {
        self.parameters.get(PARAM_DATASOURCE).and_then(Value::as_str)
    }

    /// Whether the `keep` parameter is set to something truthy.
    pub fn keep(&self) -> bool {
        match self.parameters.get(PARAM_KEEP) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            Some(Value::String(s)) => !s.is_empty() && s != "0" && !s.eq_ignore_ascii_case("false"),
            Some(_) => true,
        }
    }

    /// Whether the dataset finished with an item count rather than an error.
    pub fn has_results(&self) -> bool {
        self.is_finished && self.num_rows > 0
    }
}

/// Input for [`crate::DatasetStore::create`].
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub dataset_type: String,
    pub owner: String,
    pub parameters: Map<String, Value>,
    pub parent: Option<String>,
    pub expires_after: Option<i64>,
    /// Extension of the result artifact, without the dot.
    pub extension: String,
}

impl NewDataset {
    pub fn new(dataset_type: &str, owner: &str) -> Self {
        Self {
            dataset_type: dataset_type.to_string(),
            owner: owner.to_string(),
            parameters: Map::new(),
            parent: None,
            expires_after: None,
            extension: "ndjson".to_string(),
        }
    }

    pub fn parameter(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    pub fn parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn parent(mut self, key: &str) -> Self {
        self.parent = Some(key.to_string());
        self
    }

    pub fn expires_after(mut self, at: i64) -> Self {
        self.expires_after = Some(at);
        self
    }

    pub fn extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }
}

/// A label attached to one item of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: i64,
    pub dataset: String,
    pub item_id: String,
    pub label: String,
    pub value: String,
    pub author: String,
    /// Written by a processor rather than by hand.
    pub by_processor: bool,
    /// Last edit, unix seconds.
    pub timestamp: i64,
    pub timestamp_created: i64,
}

#[derive(Debug, Clone)]
pub struct NewAnnotation {
    pub item_id: String,
    pub label: String,
    pub value: String,
    pub author: String,
    pub by_processor: bool,
}

impl NewAnnotation {
    pub fn by_processor(item_id: &str, label: &str, value: impl ToString, author: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            label: label.to_string(),
            value: value.to_string(),
            author: author.to_string(),
            by_processor: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_keep(value: Value) -> Dataset {
        let mut parameters = Map::new();
        parameters.insert(PARAM_KEEP.to_string(), value);
        Dataset {
            key: "k".into(),
            key_parent: None,
            dataset_type: "tumblr-search".into(),
            owner: "alice".into(),
            parameters,
            timestamp: 0,
            expires_after: None,
            status: String::new(),
            num_rows: -1,
            is_finished: false,
            result_file: String::new(),
            software_version: String::new(),
        }
    }

    #[test]
    fn keep_flag_truthiness() {
        assert!(with_keep(json!(true)).keep());
        assert!(with_keep(json!(1)).keep());
        assert!(with_keep(json!("yes")).keep());
        assert!(!with_keep(json!(false)).keep());
        assert!(!with_keep(json!(0)).keep());
        assert!(!with_keep(json!("")).keep());
        assert!(!with_keep(Value::Null).keep());
    }
}
