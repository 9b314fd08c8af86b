//! Masking of PII fields in change-log snapshots.

use serde_json::Value;

/// Replacement written in place of a masked value.
pub const MASK: &str = "***";

/// Replaces the values of named fields, at any depth, with [`MASK`].
///
/// Field names match case-insensitively, either by bare name or by a
/// dot-separated path from the root (`"contact.email"`).
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    fields: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|f| f.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Mask matching fields of `value` in place.
    pub fn redact(&self, value: &mut Value) {
        if !self.is_empty() {
            self.redact_at(value, "");
        }
    }

    fn matches(&self, name: &str, path: &str) -> bool {
        self.fields.iter().any(|f| f == name || f == path)
    }

    fn redact_at(&self, value: &mut Value, prefix: &str) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    let name = key.to_lowercase();
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{prefix}.{name}")
                    };
                    if self.matches(&name, &path) {
                        *child = Value::String(MASK.to_owned());
                    } else {
                        self.redact_at(child, &path);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.redact_at(item, prefix);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn masks_by_name_and_path() {
        let redactor = Redactor::new(["original_file_name", "contact.email"]);
        let mut v = json!({
            "original_file_name": "payroll.pdf",
            "size": 10,
            "contact": { "email": "a@b.c", "name": "kept" },
            "email": "top-level stays",
        });
        redactor.redact(&mut v);
        assert_eq!(v["original_file_name"], MASK);
        assert_eq!(v["size"], 10);
        assert_eq!(v["contact"]["email"], MASK);
        assert_eq!(v["contact"]["name"], "kept");
        assert_eq!(v["email"], "top-level stays");
    }

    #[test]
    fn case_insensitive_inside_arrays() {
        let redactor = Redactor::new(["Notes"]);
        let mut v = json!([{ "notes": "x" }, { "NOTES": "y" }]);
        redactor.redact(&mut v);
        assert_eq!(v, json!([{ "notes": MASK }, { "NOTES": MASK }]));
    }

    #[test]
    fn empty_redactor_is_noop() {
        let mut v = json!({ "a": 1 });
        Redactor::default().redact(&mut v);
        assert_eq!(v, json!({ "a": 1 }));
    }
}
