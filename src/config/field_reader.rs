//! Schema-checking accessor over JSON descriptions.
//!
//! All description parsers go through `FieldReader` so that a malformed
//! field produces exactly one fatal message naming the entity, and the
//! reader never hands back a partially-filled value.

use serde_json::Value;

use crate::consumer::Logger;

/// Reference to another entity, parsed from a string (`"name"`) or a
/// two-element array (`["module", "name"]`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityName {
    pub module: String,
    pub name: String,
}

/// Names and parsed targets of an alias object, kept in field order.
#[derive(Clone, Debug, Default)]
pub struct EntityAliases {
    pub names: Vec<String>,
    pub ids: Vec<EntityName>,
}

pub struct FieldReader<'a> {
    json: &'a Value,
    entity_name: String,
    entity_type: &'static str,
    logger: Logger,
}

impl<'a> FieldReader<'a> {
    /// Wrap `json`, which must be an object; otherwise logs fatally and
    /// yields `None`.
    pub fn create(
        json: &'a Value,
        entity_name: &str,
        entity_type: &'static str,
        logger: Logger,
    ) -> Option<Self> {
        if !json.is_object() {
            logger(
                &format!("{entity_type} definition {entity_name:?} is not an object"),
                true,
            );
            return None;
        }
        Some(FieldReader {
            json,
            entity_name: entity_name.to_string(),
            entity_type,
            logger,
        })
    }

    fn fatal(&self, msg: &str) {
        (self.logger)(
            &format!("{} {:?}: {msg}", self.entity_type, self.entity_name),
            true,
        );
    }

    /// Mandatory field; fatal if missing.
    pub fn read_value(&self, field: &str) -> Option<&'a Value> {
        let value = self.json.get(field);
        if value.is_none() {
            self.fatal(&format!("Mandatory field {field:?} is missing"));
        }
        value
    }

    /// Optional field with a default.
    pub fn read_optional_value(&self, field: &str, default: &'a Value) -> &'a Value {
        self.json.get(field).unwrap_or(default)
    }

    /// Mandatory string field; fatal on absence or wrong type.
    pub fn read_string(&self, field: &str) -> Option<String> {
        let value = self.read_value(field)?;
        match value.as_str() {
            Some(s) => Some(s.to_string()),
            None => {
                self.fatal(&format!(
                    "Unsupported value {value} for mandatory field {field:?}"
                ));
                None
            }
        }
    }

    /// Optional string field; fatal only on wrong type.
    pub fn read_optional_string(&self, field: &str) -> Option<Option<String>> {
        match self.json.get(field) {
            None | Some(Value::Null) => Some(None),
            Some(Value::String(s)) => Some(Some(s.clone())),
            Some(other) => {
                self.fatal(&format!(
                    "Unsupported value {other} for optional field {field:?}"
                ));
                None
            }
        }
    }

    /// Optional list-of-strings field; absent means empty. Fatal on a
    /// non-list value or a non-string entry.
    pub fn read_string_list(&self, field: &str) -> Option<Vec<String>> {
        let list = match self.json.get(field) {
            None => return Some(Vec::new()),
            Some(value) => value,
        };
        let Some(list) = list.as_array() else {
            self.fatal(&format!(
                "Field {field:?} should be a list of strings, but found {list}"
            ));
            return None;
        };
        let mut out = Vec::with_capacity(list.len());
        for item in list {
            match item.as_str() {
                Some(s) => out.push(s.to_string()),
                None => {
                    self.fatal(&format!(
                        "Unsupported list entry {item} in field {field:?}"
                    ));
                    return None;
                }
            }
        }
        Some(out)
    }

    /// Optional object field mapping alias names to entity references;
    /// absent means empty. Fatal on shape violations.
    pub fn read_entity_aliases_object(&self, field: &str) -> Option<EntityAliases> {
        let map = match self.json.get(field) {
            None => return Some(EntityAliases::default()),
            Some(value) => value,
        };
        let Some(map) = map.as_object() else {
            self.fatal(&format!("Field {field:?} is not an object"));
            return None;
        };
        let mut aliases = EntityAliases::default();
        for (key, value) in map {
            let id = match value {
                Value::String(name) => EntityName { module: String::new(), name: name.clone() },
                Value::Array(parts) => {
                    let module = parts.first().and_then(Value::as_str);
                    let name = parts.get(1).and_then(Value::as_str);
                    match (module, name, parts.len()) {
                        (Some(module), Some(name), 2) => EntityName {
                            module: module.to_string(),
                            name: name.to_string(),
                        },
                        _ => {
                            self.fatal(&format!(
                                "Parsing entry {value} in field {field:?} failed"
                            ));
                            return None;
                        }
                    }
                }
                other => {
                    self.fatal(&format!("Parsing entry {other} in field {field:?} failed"));
                    return None;
                }
            };
            aliases.names.push(key.clone());
            aliases.ids.push(id);
        }
        Some(aliases)
    }

    /// Warn (non-fatal) about fields outside the expected set.
    pub fn expect_fields(&self, expected: &[&str]) {
        let object = self.json.as_object().expect("checked in create");
        let unexpected: Vec<&str> = object
            .keys()
            .map(String::as_str)
            .filter(|key| !expected.contains(key))
            .collect();
        if !unexpected.is_empty() {
            (self.logger)(
                &format!(
                    "{} {:?} has unexpected parameters {unexpected:?}",
                    self.entity_type, self.entity_name
                ),
                false,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::consumer::make_logger;

    fn reader_on<'a>(
        json: &'a Value,
        sink: Arc<Mutex<Vec<(String, bool)>>>,
    ) -> Option<FieldReader<'a>> {
        let logger = make_logger(move |msg, fatal| {
            sink.lock().unwrap().push((msg.to_string(), fatal));
        });
        FieldReader::create(json, "sample", "repository", logger)
    }

    #[test]
    fn test_non_object_is_fatal() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        assert!(reader_on(&json!("not a map"), sink.clone()).is_none());
        let sink = sink.lock().unwrap();
        assert_eq!(sink.len(), 1);
        assert!(sink[0].1);
    }

    #[test]
    fn test_mandatory_and_optional_strings() {
        let value = json!({"fetch": "https://example.com/x.tar", "sha256": 12});
        let sink = Arc::new(Mutex::new(Vec::new()));
        let reader = reader_on(&value, sink.clone()).unwrap();

        assert_eq!(
            reader.read_string("fetch").as_deref(),
            Some("https://example.com/x.tar")
        );
        assert!(reader.read_string("content").is_none());
        // wrong type on an optional field is still exactly one fatal log
        assert!(reader.read_optional_string("sha256").is_none());
        assert_eq!(reader.read_optional_string("distfile"), Some(None));

        let sink = sink.lock().unwrap();
        assert_eq!(sink.iter().filter(|(_, fatal)| *fatal).count(), 2);
    }

    #[test]
    fn test_string_list() {
        let value = json!({"mirrors": ["https://a", "https://b"], "broken": [1]});
        let sink = Arc::new(Mutex::new(Vec::new()));
        let reader = reader_on(&value, sink.clone()).unwrap();

        assert_eq!(reader.read_string_list("mirrors").unwrap().len(), 2);
        assert_eq!(reader.read_string_list("absent").unwrap().len(), 0);
        assert!(reader.read_string_list("broken").is_none());
    }

    #[test]
    fn test_entity_aliases() {
        let value = json!({"bindings": {"base": "base-repo", "rules": ["rules", "cc"]}});
        let sink = Arc::new(Mutex::new(Vec::new()));
        let reader = reader_on(&value, sink.clone()).unwrap();

        let aliases = reader.read_entity_aliases_object("bindings").unwrap();
        assert_eq!(aliases.names, vec!["base", "rules"]);
        assert_eq!(aliases.ids[0].name, "base-repo");
        assert_eq!(aliases.ids[1].module, "rules");

        let bad = json!({"bindings": {"x": 1}});
        let reader = reader_on(&bad, sink.clone()).unwrap();
        assert!(reader.read_entity_aliases_object("bindings").is_none());
    }

    #[test]
    fn test_expect_fields_warns_once() {
        let value = json!({"type": "file", "path": "/x", "shmype": 1});
        let sink = Arc::new(Mutex::new(Vec::new()));
        let reader = reader_on(&value, sink.clone()).unwrap();
        reader.expect_fields(&["type", "path", "pragma"]);
        let sink = sink.lock().unwrap();
        assert_eq!(sink.len(), 1);
        assert!(!sink[0].1);
        assert!(sink[0].0.contains("shmype"));
    }
}
