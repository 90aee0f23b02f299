//! Per-operation forms from Thing Descriptions
//!
//! A form tells the HTTP transport which href and method to use for an
//! operation. When a form is known the body is the raw input value instead
//! of the full request envelope.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

pub const DEFAULT_FORM_METHOD: &str = "POST";

/// How to invoke one operation over HTTP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Form {
    pub operation: String,
    /// Absolute path or URL; may contain `{thingID}` and `{name}`
    pub href: String,
    pub method: String,
    pub content_type: String,
}

impl Form {
    pub fn new(operation: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            href: href.into(),
            method: DEFAULT_FORM_METHOD.to_string(),
            content_type: "application/json".to_string(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Substitute the `{thingID}` and `{name}` path variables
    pub fn resolve_href(&self, thing_id: &str, name: &str) -> String {
        self.href
            .replace("{thingID}", thing_id)
            .replace("{name}", name)
    }

    fn from_value(operation: &str, value: &Value) -> Option<Self> {
        let href = value.get("href")?.as_str()?;
        let method = value
            .get("htv:methodName")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_FORM_METHOD);
        let content_type = value
            .get("contentType")
            .and_then(Value::as_str)
            .unwrap_or("application/json");
        Some(Self {
            operation: operation.to_string(),
            href: href.to_string(),
            method: method.to_uppercase(),
            content_type: content_type.to_string(),
        })
    }
}

/// Lookup of a form for an operation on a Thing affordance
pub trait FormProvider: Send + Sync {
    fn get_form(&self, operation: &str, thing_id: &str, name: &str) -> Option<Form>;
}

/// Forms collected from Thing Descriptions, keyed by thingID
#[derive(Debug, Default)]
pub struct TdFormStore {
    // thingID -> (operation, affordance name) -> form; "" is the Thing level
    things: RwLock<HashMap<String, HashMap<(String, String), Form>>>,
}

impl TdFormStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the forms of a TD. Replaces any forms previously stored for it.
    ///
    /// Returns the number of forms indexed, or `None` when the TD has no `id`.
    pub fn add_td(&self, td: &Value) -> Option<usize> {
        let thing_id = td.get("id")?.as_str()?.to_string();
        let mut forms = HashMap::new();

        collect_forms(td.get("forms"), "", &mut forms);
        for section in ["properties", "actions", "events"] {
            if let Some(affordances) = td.get(section).and_then(Value::as_object) {
                for (name, affordance) in affordances {
                    collect_forms(affordance.get("forms"), name, &mut forms);
                }
            }
        }

        let count = forms.len();
        self.things.write().insert(thing_id, forms);
        Some(count)
    }

    pub fn remove_td(&self, thing_id: &str) {
        self.things.write().remove(thing_id);
    }
}

fn collect_forms(forms: Option<&Value>, name: &str, out: &mut HashMap<(String, String), Form>) {
    let Some(forms) = forms.and_then(Value::as_array) else {
        return;
    };
    for form in forms {
        let ops: Vec<&str> = match form.get("op") {
            Some(Value::String(op)) => vec![op.as_str()],
            Some(Value::Array(ops)) => ops.iter().filter_map(Value::as_str).collect(),
            _ => continue,
        };
        for op in ops {
            if let Some(f) = Form::from_value(op, form) {
                out.entry((op.to_string(), name.to_string())).or_insert(f);
            }
        }
    }
}

impl FormProvider for TdFormStore {
    /// Affordance-level forms take precedence over Thing-level ones
    fn get_form(&self, operation: &str, thing_id: &str, name: &str) -> Option<Form> {
        let things = self.things.read();
        let forms = things.get(thing_id)?;
        forms
            .get(&(operation.to_string(), name.to_string()))
            .or_else(|| forms.get(&(operation.to_string(), String::new())))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lamp_td() -> Value {
        json!({
            "id": "dtw:zwave:lamp1",
            "forms": [
                {"op": "invoke-action", "href": "/things/{thingID}/{name}", "htv:methodName": "post"},
                {"op": ["read-property", "read-all-properties"], "href": "/props/{thingID}", "htv:methodName": "GET"}
            ],
            "properties": {
                "level": {
                    "forms": [{"op": "write-property", "href": "/level", "htv:methodName": "PUT"}]
                }
            },
            "actions": {"toggle": {}}
        })
    }

    #[test]
    fn test_add_td_indexes_forms() {
        let store = TdFormStore::new();
        assert_eq!(store.add_td(&lamp_td()), Some(4));
    }

    #[test]
    fn test_thing_level_form_applies_to_any_name() {
        let store = TdFormStore::new();
        store.add_td(&lamp_td());

        let form = store
            .get_form("invoke-action", "dtw:zwave:lamp1", "toggle")
            .unwrap();
        assert_eq!(form.method, "POST");
        assert_eq!(
            form.resolve_href("dtw:zwave:lamp1", "toggle"),
            "/things/dtw:zwave:lamp1/toggle"
        );
    }

    #[test]
    fn test_affordance_form_and_op_arrays() {
        let store = TdFormStore::new();
        store.add_td(&lamp_td());

        let write = store
            .get_form("write-property", "dtw:zwave:lamp1", "level")
            .unwrap();
        assert_eq!(write.method, "PUT");
        assert_eq!(write.href, "/level");

        let read_all = store
            .get_form("read-all-properties", "dtw:zwave:lamp1", "")
            .unwrap();
        assert_eq!(read_all.method, "GET");
    }

    #[test]
    fn test_unknown_thing_or_operation() {
        let store = TdFormStore::new();
        store.add_td(&lamp_td());
        assert!(store.get_form("invoke-action", "dtw:other", "x").is_none());
        assert!(store
            .get_form("subscribe-event", "dtw:zwave:lamp1", "x")
            .is_none());

        store.remove_td("dtw:zwave:lamp1");
        assert!(store
            .get_form("invoke-action", "dtw:zwave:lamp1", "toggle")
            .is_none());
    }

    #[test]
    fn test_td_without_id_is_ignored() {
        let store = TdFormStore::new();
        assert_eq!(store.add_td(&json!({"forms": []})), None);
    }
}
