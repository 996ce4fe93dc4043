//! Device twin documents.

use serde::Deserialize;
use serde_json::Value;

/// One twin sub-document: string keys to scalar values, iterated in the
/// order the hub returned them.
pub type PropertyMap = serde_json::Map<String, Value>;

/// The two property sets of a device twin. `desired` is cloud-authored and
/// read-only here; `reported` is device-authored and replaced wholesale by
/// the update operation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TwinProperties {
    #[serde(default)]
    pub desired: PropertyMap,
    #[serde(default)]
    pub reported: PropertyMap,
}

impl TwinProperties {
    /// Drop protocol bookkeeping keys (`$version` and friends) from both
    /// sub-documents. Those are not operator properties.
    pub fn strip_metadata(mut self) -> TwinProperties {
        self.desired.retain(|key, _| !key.starts_with('$'));
        self.reported.retain(|key, _| !key.starts_with('$'));
        self
    }
}

const TABLE_BORDER: &str = "----------------------------------";

/// Render a sub-document as the bordered two-column key/value table shown
/// to the operator. An empty document renders the header only.
pub fn render_property_table(properties: &PropertyMap) -> String {
    let mut table = String::new();
    table.push('\n');
    table.push_str(TABLE_BORDER);
    table.push_str("\n| \t Key \t|\t Value \t |\n");
    table.push_str(TABLE_BORDER);
    table.push('\n');

    for (key, value) in properties {
        table.push_str(&format!("| \t {key} \t|\t {} \t |\n", display_value(value)));
    }

    table.push_str(TABLE_BORDER);
    table.push('\n');
    table
}

/// Strings render bare, everything else in its JSON form.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
