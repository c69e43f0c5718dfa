use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::FormId;

/// A structured UI request for human input. The session suspends on the
/// outbound form and resumes when the reply with the matching id arrives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Form {
    pub id: FormId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub fields: Vec<Field>,
}

impl Form {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            id: FormId::new(),
            title: None,
            fields,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Keys of required fields missing from a reply's values.
    pub fn missing_required<'a>(&'a self, values: &serde_json::Map<String, Value>) -> Vec<&'a str> {
        self.fields
            .iter()
            .filter(|f| f.required && !values.contains_key(&f.key))
            .map(|f| f.key.as_str())
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub key: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<FieldRule>,
    /// Static options for select fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<FieldOption>>,
    /// Marks a select field whose options come from an async lookup.
    #[serde(rename = "async", default, skip_serializing_if = "is_false")]
    pub is_async: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_source: Option<DataSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Field {
    pub fn text(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(FieldType::Text, key, label)
    }

    pub fn select(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(FieldType::Select, key, label)
    }

    pub fn new(field_type: FieldType, key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            field_type,
            key: key.into(),
            label: label.into(),
            required: false,
            placeholder: None,
            validation: Vec::new(),
            options: None,
            is_async: false,
            data_source: None,
            default_value: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_data_source(mut self, source: DataSource) -> Self {
        self.is_async = true;
        self.data_source = Some(source);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Select,
    Number,
    Checkbox,
    Date,
    File,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    #[serde(rename = "type")]
    pub rule_type: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldOption {
    pub value: String,
    pub label: String,
}

impl FieldOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Lookup configuration for async select fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub provider: String,
    #[serde(default = "default_min_chars")]
    pub min_chars: u32,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_min_chars() -> u32 {
    2
}
fn default_debounce_ms() -> u64 {
    250
}
fn default_page_size() -> u32 {
    20
}

/// Inbound reply to an outstanding form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormReply {
    pub id: FormId,
    pub values: serde_json::Map<String, Value>,
}

/// Async select lookup issued by the client while a form is open.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormQuery {
    pub form_id: FormId,
    pub field_key: String,
    pub term: String,
    #[serde(default)]
    pub page: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_form() -> Form {
        Form::new(vec![
            Field::select("supplier", "Supplier").required().with_data_source(DataSource {
                provider: "supplier_lookup".into(),
                min_chars: 2,
                debounce_ms: 250,
                page_size: 20,
            }),
            Field::text("amount", "Amount").required(),
            Field::text("notes", "Notes"),
        ])
        .with_title("Create purchase order")
    }

    #[test]
    fn async_select_serializes_camel_case() {
        let form = sample_form();
        let json = serde_json::to_value(&form).unwrap();
        let supplier = &json["fields"][0];
        assert_eq!(supplier["type"], "select");
        assert_eq!(supplier["async"], true);
        assert_eq!(supplier["dataSource"]["provider"], "supplier_lookup");
        assert_eq!(supplier["dataSource"]["minChars"], 2);
        assert_eq!(supplier["dataSource"]["debounceMs"], 250);
        assert_eq!(supplier["dataSource"]["pageSize"], 20);
    }

    #[test]
    fn plain_field_omits_async_keys() {
        let form = sample_form();
        let json = serde_json::to_value(&form).unwrap();
        let amount = &json["fields"][1];
        assert!(amount.get("async").is_none());
        assert!(amount.get("dataSource").is_none());
        assert!(amount.get("options").is_none());
    }

    #[test]
    fn missing_required_reports_absent_keys() {
        let form = sample_form();
        let mut values = serde_json::Map::new();
        values.insert("supplier".into(), json!("S1"));
        assert_eq!(form.missing_required(&values), vec!["amount"]);

        values.insert("amount".into(), json!("1000"));
        assert!(form.missing_required(&values).is_empty());
    }

    #[test]
    fn form_roundtrip() {
        let form = sample_form();
        let json = serde_json::to_string(&form).unwrap();
        let parsed: Form = serde_json::from_str(&json).unwrap();
        assert_eq!(form, parsed);
    }

    #[test]
    fn form_query_wire_shape() {
        let query = FormQuery {
            form_id: FormId::from_raw("form_1"),
            field_key: "supplier".into(),
            term: "ac".into(),
            page: 1,
        };
        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["formId"], "form_1");
        assert_eq!(json["fieldKey"], "supplier");
        assert_eq!(json["term"], "ac");
    }

    #[test]
    fn data_source_defaults_apply() {
        let ds: DataSource = serde_json::from_value(json!({"provider": "p"})).unwrap();
        assert_eq!(ds.min_chars, 2);
        assert_eq!(ds.debounce_ms, 250);
        assert_eq!(ds.page_size, 20);
    }
}
