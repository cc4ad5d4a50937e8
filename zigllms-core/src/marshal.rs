//! ABOUTME: Type Marshaler - structured conversions between ScriptValue and host bridge records
//! ABOUTME: Grounded on llmspell-bridge's AgentConfig/ToolDefinition/WorkflowStep/ProviderConfig shapes

use crate::error::{ScriptError, ScriptErrorCode};
use crate::value::{ScriptObject, ScriptValue};
use serde::{Deserialize, Serialize};

/// Converts a host record to/from `ScriptValue`, raising `Type` errors that
/// name the offending field via `ScriptError::for_field`.
pub trait Marshal: Sized {
    fn to_script_value(&self) -> Result<ScriptValue, ScriptError>;
    fn from_script_value(value: &ScriptValue) -> Result<Self, ScriptError>;
}

fn require_object<'a>(value: &'a ScriptValue, type_name: &str) -> Result<&'a ScriptObject, ScriptError> {
    match value {
        ScriptValue::Object(obj) => Ok(obj),
        other => Err(ScriptError::new(
            ScriptErrorCode::Type,
            format!("expected object for {type_name}, got {}", other.type_name()),
        )),
    }
}

fn require_string(obj: &ScriptObject, field: &str) -> Result<String, ScriptError> {
    match obj.get(field) {
        Some(v) => v
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ScriptError::for_field(ScriptErrorCode::Type, field, format!("field '{field}' must be a string"))),
        None => Err(ScriptError::for_field(ScriptErrorCode::Type, field, format!("missing required field '{field}'"))),
    }
}

fn optional_string(obj: &ScriptObject, field: &str) -> Option<String> {
    obj.get(field).and_then(ScriptValue::as_str).map(str::to_string)
}

fn optional_f64(obj: &ScriptObject, field: &str) -> Result<Option<f64>, ScriptError> {
    match obj.get(field) {
        None | Some(ScriptValue::Nil) => Ok(None),
        Some(ScriptValue::Number(n)) => Ok(Some(*n)),
        Some(ScriptValue::Integer(n)) => Ok(Some(*n as f64)),
        Some(_) => Err(ScriptError::for_field(
            ScriptErrorCode::Type,
            field,
            format!("field '{field}' must be numeric"),
        )),
    }
}

fn string_array(obj: &ScriptObject, field: &str) -> Result<Vec<String>, ScriptError> {
    match obj.get(field) {
        None => Ok(Vec::new()),
        Some(ScriptValue::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    ScriptError::for_field(ScriptErrorCode::Type, field, format!("'{field}' must be an array of strings"))
                })
            })
            .collect(),
        Some(_) => Err(ScriptError::for_field(ScriptErrorCode::Type, field, format!("'{field}' must be an array"))),
    }
}

/// `{name, provider, model, temperature?, max_tokens?, tools[]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub provider: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub tools: Vec<String>,
}

impl Marshal for AgentConfig {
    fn to_script_value(&self) -> Result<ScriptValue, ScriptError> {
        let mut obj = ScriptObject::new();
        obj.insert("name", ScriptValue::string(&self.name));
        obj.insert("provider", ScriptValue::string(&self.provider));
        obj.insert("model", ScriptValue::string(&self.model));
        obj.insert("temperature", self.temperature.map_or(ScriptValue::Nil, ScriptValue::Number));
        obj.insert(
            "max_tokens",
            self.max_tokens.map_or(ScriptValue::Nil, |n| ScriptValue::Integer(n as i64)),
        );
        obj.insert(
            "tools",
            ScriptValue::Array(self.tools.iter().map(ScriptValue::string).collect()),
        );
        Ok(ScriptValue::Object(obj))
    }

    fn from_script_value(value: &ScriptValue) -> Result<Self, ScriptError> {
        let obj = require_object(value, "AgentConfig")?;
        Ok(Self {
            name: require_string(obj, "name")?,
            provider: require_string(obj, "provider")?,
            model: require_string(obj, "model")?,
            temperature: optional_f64(obj, "temperature")?,
            max_tokens: match obj.get("max_tokens") {
                None | Some(ScriptValue::Nil) => None,
                Some(ScriptValue::Integer(n)) if *n >= 0 => Some(*n as u64),
                Some(_) => {
                    return Err(ScriptError::for_field(
                        ScriptErrorCode::Type,
                        "max_tokens",
                        "field 'max_tokens' must be a non-negative integer",
                    ))
                }
            },
            tools: string_array(obj, "tools")?,
        })
    }
}

/// `{name, description, schema?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub schema: Option<serde_json::Value>,
}

impl Marshal for ToolDefinition {
    fn to_script_value(&self) -> Result<ScriptValue, ScriptError> {
        let mut obj = ScriptObject::new();
        obj.insert("name", ScriptValue::string(&self.name));
        obj.insert("description", ScriptValue::string(&self.description));
        obj.insert(
            "schema",
            self.schema.as_ref().map_or(ScriptValue::Nil, ScriptValue::from_json),
        );
        Ok(ScriptValue::Object(obj))
    }

    fn from_script_value(value: &ScriptValue) -> Result<Self, ScriptError> {
        let obj = require_object(value, "ToolDefinition")?;
        let schema = match obj.get("schema") {
            None | Some(ScriptValue::Nil) => None,
            Some(v) => Some(v.to_json()?),
        };
        Ok(Self {
            name: require_string(obj, "name")?,
            description: require_string(obj, "description")?,
            schema,
        })
    }
}

/// `{name, agent, action, params, depends_on[]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub agent: String,
    pub action: String,
    pub params: serde_json::Value,
    pub depends_on: Vec<String>,
}

impl Marshal for WorkflowStep {
    fn to_script_value(&self) -> Result<ScriptValue, ScriptError> {
        let mut obj = ScriptObject::new();
        obj.insert("name", ScriptValue::string(&self.name));
        obj.insert("agent", ScriptValue::string(&self.agent));
        obj.insert("action", ScriptValue::string(&self.action));
        obj.insert("params", ScriptValue::from_json(&self.params));
        obj.insert(
            "depends_on",
            ScriptValue::Array(self.depends_on.iter().map(ScriptValue::string).collect()),
        );
        Ok(ScriptValue::Object(obj))
    }

    fn from_script_value(value: &ScriptValue) -> Result<Self, ScriptError> {
        let obj = require_object(value, "WorkflowStep")?;
        Ok(Self {
            name: require_string(obj, "name")?,
            agent: require_string(obj, "agent")?,
            action: require_string(obj, "action")?,
            params: obj.get("params").map_or(Ok(serde_json::Value::Null), ScriptValue::to_json)?,
            depends_on: string_array(obj, "depends_on")?,
        })
    }
}

/// `{name, type, base_url?, api_key?, models[], timeout}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub models: Vec<String>,
    pub timeout: u64,
}

impl Marshal for ProviderConfig {
    fn to_script_value(&self) -> Result<ScriptValue, ScriptError> {
        let mut obj = ScriptObject::new();
        obj.insert("name", ScriptValue::string(&self.name));
        obj.insert("type", ScriptValue::string(&self.provider_type));
        obj.insert("base_url", self.base_url.as_deref().map_or(ScriptValue::Nil, ScriptValue::string));
        obj.insert("api_key", self.api_key.as_deref().map_or(ScriptValue::Nil, ScriptValue::string));
        obj.insert("models", ScriptValue::Array(self.models.iter().map(ScriptValue::string).collect()));
        obj.insert("timeout", ScriptValue::Integer(self.timeout as i64));
        Ok(ScriptValue::Object(obj))
    }

    fn from_script_value(value: &ScriptValue) -> Result<Self, ScriptError> {
        let obj = require_object(value, "ProviderConfig")?;
        let timeout = match obj.get("timeout") {
            Some(ScriptValue::Integer(n)) if *n >= 0 => *n as u64,
            Some(ScriptValue::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => *n as u64,
            None => return Err(ScriptError::for_field(ScriptErrorCode::Type, "timeout", "missing required field 'timeout'")),
            Some(_) => {
                return Err(ScriptError::for_field(
                    ScriptErrorCode::Type,
                    "timeout",
                    "field 'timeout' must be a non-negative integer",
                ))
            }
        };
        Ok(Self {
            name: require_string(obj, "name")?,
            provider_type: require_string(obj, "type")?,
            base_url: optional_string(obj, "base_url"),
            api_key: optional_string(obj, "api_key"),
            models: string_array(obj, "models")?,
            timeout,
        })
    }
}

/// `{event_type, timestamp, data}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub event_type: String,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

impl Marshal for EventData {
    fn to_script_value(&self) -> Result<ScriptValue, ScriptError> {
        let mut obj = ScriptObject::new();
        obj.insert("event_type", ScriptValue::string(&self.event_type));
        obj.insert("timestamp", ScriptValue::Integer(self.timestamp));
        obj.insert("data", ScriptValue::from_json(&self.data));
        Ok(ScriptValue::Object(obj))
    }

    fn from_script_value(value: &ScriptValue) -> Result<Self, ScriptError> {
        let obj = require_object(value, "EventData")?;
        let timestamp = match obj.get("timestamp") {
            Some(ScriptValue::Integer(n)) => *n,
            Some(ScriptValue::Number(n)) => *n as i64,
            None => return Err(ScriptError::for_field(ScriptErrorCode::Type, "timestamp", "missing required field 'timestamp'")),
            Some(_) => {
                return Err(ScriptError::for_field(ScriptErrorCode::Type, "timestamp", "field 'timestamp' must be numeric"))
            }
        };
        Ok(Self {
            event_type: require_string(obj, "event_type")?,
            timestamp,
            data: obj.get("data").map_or(Ok(serde_json::Value::Null), ScriptValue::to_json)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_round_trips() {
        let config = AgentConfig {
            name: "a".to_string(),
            provider: "p".to_string(),
            model: "m".to_string(),
            temperature: Some(0.5),
            max_tokens: Some(2000),
            tools: vec!["t1".to_string(), "t2".to_string()],
        };
        let value = config.to_script_value().unwrap();
        let back = AgentConfig::from_script_value(&value).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn agent_config_rejects_non_numeric_temperature() {
        let mut obj = ScriptObject::new();
        obj.insert("name", ScriptValue::string("a"));
        obj.insert("provider", ScriptValue::string("p"));
        obj.insert("model", ScriptValue::string("m"));
        obj.insert("temperature", ScriptValue::string("hot"));
        let err = AgentConfig::from_script_value(&ScriptValue::Object(obj)).unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Type);
        assert_eq!(err.context.unwrap()["field"], "temperature");
    }

    #[test]
    fn missing_required_field_names_it_in_context() {
        let obj = ScriptObject::new();
        let err = ToolDefinition::from_script_value(&ScriptValue::Object(obj)).unwrap_err();
        assert_eq!(err.code, ScriptErrorCode::Type);
        assert_eq!(err.context.unwrap()["field"], "name");
    }

    #[test]
    fn functions_and_userdata_cannot_marshal_to_json_via_params() {
        let step = WorkflowStep {
            name: "s".to_string(),
            agent: "a".to_string(),
            action: "act".to_string(),
            params: serde_json::json!({"k": 1}),
            depends_on: vec![],
        };
        let value = step.to_script_value().unwrap();
        let back = WorkflowStep::from_script_value(&value).unwrap();
        assert_eq!(step, back);
    }

    #[test]
    fn provider_config_round_trips_with_optional_fields_absent() {
        let config = ProviderConfig {
            name: "openai".to_string(),
            provider_type: "chat".to_string(),
            base_url: None,
            api_key: None,
            models: vec!["gpt".to_string()],
            timeout: 30,
        };
        let value = config.to_script_value().unwrap();
        let back = ProviderConfig::from_script_value(&value).unwrap();
        assert_eq!(config, back);
    }
}
