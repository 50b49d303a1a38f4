// Numan Thabit 2025
//! `${name}` substitution for request urls, headers and bodies.
//!
//! Templates are parsed once at config time so that every reference can be
//! checked against the variables available at its step.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::TemplateError;

/// Iteration-scoped variable bindings.
pub type Vars = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Var(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;

        while let Some(start) = rest.find("${") {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| TemplateError::Unterminated(raw.to_string()))?;
            let name = after[..end].trim();
            if name.is_empty() {
                return Err(TemplateError::EmptyName(raw.to_string()));
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Var(name.to_string()));
            rest = &after[end + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Names referenced by this template, in order of appearance.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Var(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// The variable name when the template is exactly one `${name}` reference.
    pub fn single_var(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [Segment::Var(name)] => Some(name),
            _ => None,
        }
    }

    pub fn render(&self, vars: &Vars) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var(name) => {
                    let value = vars
                        .get(name)
                        .ok_or_else(|| TemplateError::Undefined(name.clone()))?;
                    out.push_str(&value_to_text(value));
                }
            }
        }
        Ok(out)
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// JSON document whose string leaves may carry `${name}` references.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonTemplate {
    Literal(Value),
    Text(Template),
    Array(Vec<JsonTemplate>),
    Object(Vec<(String, JsonTemplate)>),
}

impl JsonTemplate {
    pub fn compile(value: &Value) -> Result<Self, TemplateError> {
        Ok(match value {
            Value::String(text) if text.contains("${") => Self::Text(Template::parse(text)?),
            Value::Array(items) => Self::Array(
                items
                    .iter()
                    .map(Self::compile)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(key, item)| Self::compile(item).map(|item| (key.clone(), item)))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            other => Self::Literal(other.clone()),
        })
    }

    pub fn variables(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Self::Literal(_) => {}
            Self::Text(template) => names.extend(template.variables()),
            Self::Array(items) => items.iter().for_each(|item| item.collect_variables(names)),
            Self::Object(fields) => fields
                .iter()
                .for_each(|(_, item)| item.collect_variables(names)),
        }
    }

    /// Render to a JSON value. A string that is exactly `${name}` takes the
    /// bound value as-is, so numbers and objects keep their JSON type.
    pub fn render(&self, vars: &Vars) -> Result<Value, TemplateError> {
        Ok(match self {
            Self::Literal(value) => value.clone(),
            Self::Text(template) => match template.single_var() {
                Some(name) => vars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TemplateError::Undefined(name.to_string()))?,
                None => Value::String(template.render(vars)?),
            },
            Self::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.render(vars))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Self::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (key, item) in fields {
                    map.insert(key.clone(), item.render(vars)?);
                }
                Value::Object(map)
            }
        })
    }
}
