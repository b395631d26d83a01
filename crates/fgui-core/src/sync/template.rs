use crate::api::{FieldSpec, FieldType, Record, ID_FIELD};
use std::collections::HashMap;

/// Options for [`representative_record`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemplateOptions {
    /// Leave the identifier field out of the template
    pub clean_id: bool,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self { clean_id: true }
    }
}

/// Starting template before any record has been seen.
pub fn empty_template() -> Record {
    let mut template = Record::new();
    template.insert(ID_FIELD.to_string(), serde_json::Value::String(String::new()));
    template
}

/// Fold an observed record into the template; later keys win.
pub fn merge_template(template: &mut Record, record: &Record) {
    for (key, value) in record {
        template.insert(key.clone(), value.clone());
    }
}

/// Scaffold for a new record: every key seen so far, set to the default of
/// its declared type. Keys without a declared type default to `""`.
pub fn representative_record(
    template: &Record,
    fields: &[FieldSpec],
    options: TemplateOptions,
) -> Record {
    let types: HashMap<&str, FieldType> = fields
        .iter()
        .map(|f| (f.property.as_str(), f.field_type))
        .collect();

    template
        .keys()
        .filter(|key| !(options.clean_id && key.as_str() == ID_FIELD))
        .map(|key| {
            let field_type = types.get(key.as_str()).copied().unwrap_or_default();
            (key.clone(), field_type.default_value())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("_id", FieldType::String),
            FieldSpec::new("count", FieldType::Number),
        ]
    }

    #[test]
    fn typed_defaults_without_id() {
        let mut template = empty_template();
        merge_template(&mut template, &rec(json!({"_id": "z", "count": 5})));

        let scaffold = representative_record(&template, &fields(), TemplateOptions::default());
        assert_eq!(scaffold, rec(json!({"count": 0})));
    }

    #[test]
    fn keeps_id_when_asked() {
        let mut template = empty_template();
        merge_template(&mut template, &rec(json!({"_id": "z", "count": 5})));

        let options = TemplateOptions { clean_id: false };
        let scaffold = representative_record(&template, &fields(), options);
        assert_eq!(scaffold, rec(json!({"_id": "", "count": 0})));
    }

    #[test]
    fn union_of_observed_keys() {
        let mut template = empty_template();
        merge_template(&mut template, &rec(json!({"_id": "a", "name": "x"})));
        merge_template(&mut template, &rec(json!({"_id": "b", "tags": ["t"]})));

        let scaffold = representative_record(&template, &fields(), TemplateOptions::default());
        assert_eq!(scaffold, rec(json!({"name": "", "tags": ""})));
    }
}
