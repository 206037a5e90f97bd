//! 动态工具 Schema 校验
//!
//! 依次检查：必需字段、参数结构、参数类型。第一个失败的检查短路返回具体原因。

use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;

use crate::tools::schema::{ParamType, ToolParameter, ToolSchema, SUPPORTED_TYPES};

/// 哪一项检查失败
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaCheck {
    RequiredFields,
    ParameterStructure,
    ParameterTypes,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct SchemaRejection {
    pub check: SchemaCheck,
    pub reason: String,
}

impl SchemaRejection {
    fn new(check: SchemaCheck, reason: impl Into<String>) -> Self {
        Self {
            check,
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// 校验候选 Schema，通过则返回可注册的 ToolSchema
    pub fn validate(&self, candidate: &Value) -> Result<ToolSchema, SchemaRejection> {
        let (name, description, params) = required_fields(candidate)?;
        let shaped = parameter_structure(params)?;
        let parameters = parameter_types(shaped)?;
        Ok(ToolSchema {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        })
    }
}

fn required_fields(candidate: &Value) -> Result<(&str, &str, &Vec<Value>), SchemaRejection> {
    let obj = candidate
        .as_object()
        .ok_or_else(|| SchemaRejection::new(SchemaCheck::RequiredFields, "schema must be a JSON object"))?;

    let name = text_field(obj, "name")?;
    let description = text_field(obj, "description")?;

    let params = match obj.get("parameters") {
        None => {
            return Err(SchemaRejection::new(
                SchemaCheck::RequiredFields,
                "missing required field `parameters`",
            ))
        }
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(SchemaRejection::new(
                SchemaCheck::RequiredFields,
                "field `parameters` must be a list",
            ))
        }
    };
    Ok((name, description, params))
}

fn text_field<'a>(obj: &'a serde_json::Map<String, Value>, field: &str) -> Result<&'a str, SchemaRejection> {
    match obj.get(field) {
        None => Err(SchemaRejection::new(
            SchemaCheck::RequiredFields,
            format!("missing required field `{field}`"),
        )),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(_) => Err(SchemaRejection::new(
            SchemaCheck::RequiredFields,
            format!("field `{field}` must be a non-empty string"),
        )),
    }
}

/// 参数结构检查后的中间形态：(name, 声明的类型名, 描述, 是否必需)
type Shaped<'a> = (&'a str, &'a str, &'a str, bool);

fn parameter_structure(params: &[Value]) -> Result<Vec<Shaped<'_>>, SchemaRejection> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(params.len());
    for (i, param) in params.iter().enumerate() {
        let obj = param.as_object().ok_or_else(|| {
            SchemaRejection::new(
                SchemaCheck::ParameterStructure,
                format!("parameter #{i} must be an object"),
            )
        })?;
        let name = match obj.get("name").and_then(|v| v.as_str()) {
            Some(n) if !n.trim().is_empty() => n,
            _ => {
                return Err(SchemaRejection::new(
                    SchemaCheck::ParameterStructure,
                    format!("parameter #{i} has no name"),
                ))
            }
        };
        let kind = obj.get("type").and_then(|v| v.as_str()).ok_or_else(|| {
            SchemaRejection::new(
                SchemaCheck::ParameterStructure,
                format!("parameter `{name}` has no declared type"),
            )
        })?;
        if !seen.insert(name) {
            return Err(SchemaRejection::new(
                SchemaCheck::ParameterStructure,
                format!("parameter `{name}` declared twice"),
            ));
        }
        let description = obj.get("description").and_then(|v| v.as_str()).unwrap_or("");
        let required = obj.get("required").and_then(|v| v.as_bool()).unwrap_or(false);
        out.push((name, kind, description, required));
    }
    Ok(out)
}

fn parameter_types(shaped: Vec<Shaped<'_>>) -> Result<Vec<ToolParameter>, SchemaRejection> {
    shaped
        .into_iter()
        .map(|(name, kind, description, required)| {
            let kind = ParamType::parse(kind).ok_or_else(|| {
                SchemaRejection::new(
                    SchemaCheck::ParameterTypes,
                    format!(
                        "parameter `{name}` has unsupported type `{kind}` (supported: {})",
                        SUPPORTED_TYPES.join(", ")
                    ),
                )
            })?;
            Ok(ToolParameter {
                name: name.to_string(),
                kind,
                description: description.to_string(),
                required,
            })
        })
        .collect()
}
