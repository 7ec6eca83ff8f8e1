use crate::{
    error::{Result, ServiceError},
    time::parse_datetime,
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamType {
    String {
        #[serde(default, rename = "maxLength", skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
    },
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Boolean,
    Date,
    Enum {
        values: Vec<String>,
    },
    StringList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDef {
    pub name: String,
    pub display_name: String,
    #[serde(flatten)]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterDef {
    pub fn new(name: &str, display_name: &str, kind: ParamType) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            kind,
            required: false,
            default: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

impl ParamType {
    pub fn integer(min: i64, max: i64) -> Self {
        ParamType::Integer {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn string(max_length: usize) -> Self {
        ParamType::String {
            max_length: Some(max_length),
        }
    }

    pub fn one_of(values: &[&str]) -> Self {
        ParamType::Enum {
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Checks a value and returns its normalized form.
    pub fn validate(&self, name: &str, value: &Value) -> Result<Value> {
        match self {
            ParamType::String { max_length } => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return Err(invalid(name, "a string")),
                };
                if let Some(max) = max_length {
                    if text.chars().count() > *max {
                        return Err(ServiceError::validation(format!(
                            "parameter '{name}' must be at most {max} characters"
                        )));
                    }
                }
                Ok(Value::String(text))
            }
            ParamType::Integer { min, max } => {
                let number = match value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| invalid(name, "an integer"))?;

                let below = min.is_some_and(|min| number < min);
                let above = max.is_some_and(|max| number > max);
                if below || above {
                    let message = match (min, max) {
                        (Some(min), Some(max)) => {
                            format!("parameter '{name}' must be between {min} and {max}")
                        }
                        (Some(min), None) => format!("parameter '{name}' must be at least {min}"),
                        (None, Some(max)) => format!("parameter '{name}' must be at most {max}"),
                        (None, None) => format!("parameter '{name}' is out of range"),
                    };
                    return Err(ServiceError::validation(message));
                }
                Ok(Value::Number(number.into()))
            }
            ParamType::Boolean => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" => Ok(Value::Bool(false)),
                    _ => Err(invalid(name, "a boolean")),
                },
                _ => Err(invalid(name, "a boolean")),
            },
            ParamType::Date => value
                .as_str()
                .and_then(parse_datetime)
                .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))
                .ok_or_else(|| invalid(name, "an ISO-8601 date")),
            ParamType::Enum { values } => {
                let text = value.as_str().ok_or_else(|| invalid(name, "a string"))?;
                values
                    .iter()
                    .find(|allowed| allowed.eq_ignore_ascii_case(text))
                    .map(|allowed| Value::String(allowed.clone()))
                    .ok_or_else(|| {
                        ServiceError::validation(format!(
                            "parameter '{name}' must be one of: {}",
                            values.join(", ")
                        ))
                    })
            }
            ParamType::StringList => {
                let items: Vec<Value> = match value {
                    Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => Ok(Value::String(s.trim().to_string())),
                            _ => Err(invalid(name, "a list of strings")),
                        })
                        .collect::<Result<_>>()?,
                    Value::String(s) => s
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                    _ => return Err(invalid(name, "a list of strings")),
                };
                Ok(Value::Array(items))
            }
        }
    }
}

fn invalid(name: &str, expected: &str) -> ServiceError {
    ServiceError::validation(format!("parameter '{name}' must be {expected}"))
}

/// Validates caller parameters against the declared list, applying defaults.
/// Unknown parameters are rejected so they cannot leak into cache keys.
pub fn normalize_parameters(
    declared: &[ParameterDef],
    provided: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    if let Some(unknown) = provided
        .keys()
        .find(|key| !declared.iter().any(|def| &def.name == *key))
    {
        return Err(ServiceError::validation(format!(
            "unknown parameter '{unknown}'"
        )));
    }

    let mut normalized = Map::new();
    for def in declared {
        let value = match provided.get(&def.name).filter(|v| !v.is_null()) {
            Some(value) => Some(value),
            None => def.default.as_ref(),
        };

        match value {
            Some(value) => {
                normalized.insert(def.name.clone(), def.kind.validate(&def.name, value)?);
            }
            None if def.required => {
                return Err(ServiceError::validation(format!(
                    "missing required parameter '{}'",
                    def.name
                )))
            }
            None => {}
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn days() -> ParameterDef {
        ParameterDef::new("days", "Days", ParamType::integer(1, 3650))
            .required()
            .with_default(json!(90))
    }

    #[test]
    fn integer_bounds_are_inclusive() {
        let kind = ParamType::integer(1, 3650);
        assert_eq!(kind.validate("days", &json!(1)).unwrap(), json!(1));
        assert_eq!(kind.validate("days", &json!(3650)).unwrap(), json!(3650));
        assert_eq!(kind.validate("days", &json!("42")).unwrap(), json!(42));
        for bad in [json!(0), json!(3651), json!("ninety"), json!(true)] {
            let err = kind.validate("days", &bad).unwrap_err();
            assert!(err.to_string().contains("days"), "{bad}: {err}");
        }
    }

    #[test]
    fn defaults_apply_and_unknowns_fail() {
        let declared = vec![
            days(),
            ParameterDef::new("department", "Department", ParamType::string(64)),
        ];

        let normalized = normalize_parameters(&declared, &Map::new()).unwrap();
        assert_eq!(Value::Object(normalized), json!({ "days": 90 }));

        let provided = json!({ "days": 30, "department": "IT" });
        let normalized = normalize_parameters(&declared, provided.as_object().unwrap()).unwrap();
        assert_eq!(Value::Object(normalized), json!({ "days": 30, "department": "IT" }));

        let provided = json!({ "dayz": 30 });
        let err = normalize_parameters(&declared, provided.as_object().unwrap()).unwrap_err();
        assert!(err.to_string().contains("dayz"));
    }

    #[test]
    fn missing_required_without_default_fails() {
        let declared = vec![ParameterDef::new("groupDn", "Group", ParamType::string(512)).required()];
        let err = normalize_parameters(&declared, &Map::new()).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("groupDn")));
    }

    #[test]
    fn enum_string_list_and_date_normalize() {
        let period = ParamType::one_of(&["D7", "D30"]);
        assert_eq!(period.validate("period", &json!("d30")).unwrap(), json!("D30"));
        assert!(period.validate("period", &json!("D365")).is_err());

        let list = ParamType::StringList;
        assert_eq!(
            list.validate("skus", &json!("a, b,,c")).unwrap(),
            json!(["a", "b", "c"])
        );

        assert_eq!(
            ParamType::Date.validate("since", &json!("2024-02-01")).unwrap(),
            json!("2024-02-01T00:00:00Z")
        );
    }

    #[test]
    fn parameter_types_use_tagged_json() {
        let def: ParameterDef = serde_json::from_value(json!({
            "name": "days",
            "displayName": "Days",
            "type": "integer",
            "min": 1,
            "max": 30,
            "required": true
        }))
        .unwrap();
        assert_eq!(def.kind, ParamType::integer(1, 30));

        let unknown = serde_json::from_value::<ParameterDef>(json!({
            "name": "x",
            "displayName": "X",
            "type": "uuid"
        }));
        assert!(unknown.is_err());
    }
}
