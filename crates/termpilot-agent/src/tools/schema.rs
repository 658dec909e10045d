//! Parameter schemas for tools.
//!
//! A [`ToolSchema`] is the typed source of the JSON schema sent to the
//! model, and the validator applied to the arguments it sends back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// JSON type of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    /// Best-effort conversion of a mistyped scalar, e.g. `"5"` for an
    /// integer parameter.
    fn coerce(self, value: &Value) -> Option<Value> {
        let text = value.as_str();
        match self {
            Self::String => match value {
                Value::Number(n) => Some(Value::String(n.to_string())),
                Value::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            Self::Integer => text
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(Value::from)
                .or_else(|| {
                    value
                        .as_f64()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| Value::from(f as i64))
                }),
            Self::Number => text
                .and_then(|s| s.trim().parse::<f64>().ok())
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number)),
            Self::Boolean => match text.map(|s| s.trim().to_ascii_lowercase()) {
                Some(s) if s == "true" => Some(Value::Bool(true)),
                Some(s) if s == "false" => Some(Value::Bool(false)),
                _ => None,
            },
            Self::Array | Self::Object => text
                .and_then(|s| serde_json::from_str::<Value>(s).ok())
                .filter(|v| self.matches(v)),
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Ordered parameter list of a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    params: Vec<ParamSpec>,
}

impl ToolSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, name: &str, kind: ParamType, description: &str) -> Self {
        self.param(name, kind, description, true)
    }

    pub fn optional(self, name: &str, kind: ParamType, description: &str) -> Self {
        self.param(name, kind, description, false)
    }

    /// Restrict the most recently added parameter to `values`.
    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        if let Some(last) = self.params.last_mut() {
            last.enum_values = values.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Default for the most recently added parameter.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        if let Some(last) = self.params.last_mut() {
            last.default = Some(value.into());
        }
        self
    }

    fn param(mut self, name: &str, kind: ParamType, description: &str, required: bool) -> Self {
        self.params.retain(|p| p.name != name);
        self.params.push(ParamSpec {
            name: name.to_owned(),
            kind,
            description: description.to_owned(),
            required,
            enum_values: Vec::new(),
            default: None,
        });
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn param_spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// JSON schema object for the function-tool `parameters` field.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.params {
            let mut prop = Map::new();
            prop.insert("type".into(), json!(p.kind.as_str()));
            prop.insert("description".into(), json!(p.description));
            if !p.enum_values.is_empty() {
                prop.insert("enum".into(), Value::Array(p.enum_values.clone()));
            }
            if let Some(default) = &p.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(p.name.clone(), Value::Object(prop));
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check `args` against the schema and return every problem found.
    ///
    /// Unknown parameters are tolerated; models often add harmless extras.
    pub fn validate(&self, args: &Value) -> Result<(), Vec<String>> {
        let empty = Map::new();
        let obj = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(vec![format!("arguments must be a JSON object, got {}", type_name(other))]),
        };

        let mut issues = Vec::new();
        for p in &self.params {
            match obj.get(&p.name) {
                None | Some(Value::Null) => {
                    if p.required && p.default.is_none() {
                        issues.push(format!("missing required parameter `{}`", p.name));
                    }
                }
                Some(value) => {
                    if !p.kind.matches(value) {
                        issues.push(format!(
                            "parameter `{}` must be of type {}, got {}",
                            p.name,
                            p.kind.as_str(),
                            type_name(value)
                        ));
                    } else if !p.enum_values.is_empty() && !p.enum_values.contains(value) {
                        issues.push(format!(
                            "parameter `{}` must be one of {}, got {value}",
                            p.name,
                            Value::Array(p.enum_values.clone())
                        ));
                    }
                }
            }
        }
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    /// Fill declared defaults for absent parameters.
    pub fn apply_defaults(&self, args: Value) -> Value {
        let mut obj = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return other,
        };
        for p in &self.params {
            if let Some(default) = &p.default {
                let absent = matches!(obj.get(&p.name), None | Some(Value::Null));
                if absent {
                    obj.insert(p.name.clone(), default.clone());
                }
            }
        }
        Value::Object(obj)
    }

    /// Convert mistyped scalars to their declared types.
    ///
    /// Returns `None` when nothing could be changed.
    pub fn coerce(&self, args: &Value) -> Option<Value> {
        let Value::Object(obj) = args else {
            return None;
        };
        let mut out = obj.clone();
        let mut changed = false;
        for p in &self.params {
            let Some(value) = obj.get(&p.name) else {
                continue;
            };
            if p.kind.matches(value) {
                continue;
            }
            if let Some(fixed) = p.kind.coerce(value) {
                out.insert(p.name.clone(), fixed);
                changed = true;
            }
        }
        changed.then_some(Value::Object(out))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ToolSchema {
        ToolSchema::new()
            .required("path", ParamType::String, "File path")
            .optional("limit", ParamType::Integer, "Max lines")
            .default_value(200)
            .optional("mode", ParamType::String, "Open mode")
            .one_of(["read", "append"])
    }

    #[test]
    fn json_schema_shape() {
        let s = schema().to_json_schema();
        assert_eq!(s["type"], "object");
        assert_eq!(s["required"], json!(["path"]));
        assert_eq!(s["properties"]["limit"]["default"], 200);
        assert_eq!(s["properties"]["mode"]["enum"], json!(["read", "append"]));
    }

    #[test]
    fn validation_reports_every_issue() {
        let issues = schema()
            .validate(&json!({"limit": "ten", "mode": "write"}))
            .unwrap_err();
        assert_eq!(issues.len(), 3);
        assert!(issues[0].contains("missing required parameter `path`"));
        assert!(issues[1].contains("must be of type integer"));
        assert!(issues[2].contains("must be one of"));
    }

    #[test]
    fn validation_accepts_extras_and_null_args() {
        assert!(schema().validate(&json!({"path": "a", "extra": 1})).is_ok());
        assert!(ToolSchema::new().validate(&Value::Null).is_ok());
        assert!(schema().validate(&json!("path")).is_err());
    }

    #[test]
    fn defaults_fill_absent_params() {
        let args = schema().apply_defaults(json!({"path": "a"}));
        assert_eq!(args["limit"], 200);
    }

    #[test]
    fn coercion_fixes_scalars() {
        let fixed = schema().coerce(&json!({"path": 7, "limit": "10"})).unwrap();
        assert_eq!(fixed["path"], "7");
        assert_eq!(fixed["limit"], 10);
        assert!(schema().coerce(&json!({"path": "ok"})).is_none());
    }
}
