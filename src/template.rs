//! Message templates: provider message objects with `{{key}}` placeholders.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Provider limit on message objects per send.
pub const MAX_MESSAGES: usize = 5;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid placeholder regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template has no messages")]
    Empty,
    #[error("template has {count} messages, provider accepts at most {max}")]
    TooMany { count: usize, max: usize },
    #[error("message #{0} is not a JSON object")]
    NotObject(usize),
    #[error("malformed placeholder in {0:?}")]
    Malformed(String),
    #[error("no value for placeholder {{{{{0}}}}}")]
    Unresolved(String),
}

/// Rendered message list handed to the delivery provider.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MessagePayload {
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    messages: Vec<Value>,
}

impl Template {
    pub fn parse(messages: Vec<Value>) -> Result<Self, TemplateError> {
        if messages.is_empty() {
            return Err(TemplateError::Empty);
        }
        if messages.len() > MAX_MESSAGES {
            return Err(TemplateError::TooMany {
                count: messages.len(),
                max: MAX_MESSAGES,
            });
        }
        for (idx, msg) in messages.iter().enumerate() {
            if !msg.is_object() {
                return Err(TemplateError::NotObject(idx));
            }
            let mut bad = None;
            visit_strings(msg, &mut |s| {
                if bad.is_none() && PLACEHOLDER_RE.replace_all(s, "").contains("{{") {
                    bad = Some(s.to_string());
                }
            });
            if let Some(s) = bad {
                return Err(TemplateError::Malformed(s));
            }
        }
        Ok(Self { messages })
    }

    /// Every placeholder name referenced anywhere in the template.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for msg in &self.messages {
            visit_strings(msg, &mut |s| {
                for cap in PLACEHOLDER_RE.captures_iter(s) {
                    names.insert(cap[1].to_string());
                }
            });
        }
        names
    }

    pub fn render(&self, vars: &BTreeMap<String, String>) -> Result<MessagePayload, TemplateError> {
        if let Some(missing) = self.placeholders().into_iter().find(|n| !vars.contains_key(n)) {
            return Err(TemplateError::Unresolved(missing));
        }
        let messages = self
            .messages
            .iter()
            .map(|msg| substitute(msg, vars))
            .collect();
        Ok(MessagePayload { messages })
    }
}

fn visit_strings(value: &Value, f: &mut dyn FnMut(&str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|v| visit_strings(v, f)),
        Value::Object(map) => map.values().for_each(|v| visit_strings(v, f)),
        _ => {}
    }
}

fn substitute(value: &Value, vars: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => {
            let out = PLACEHOLDER_RE.replace_all(s, |cap: &regex::Captures<'_>| {
                vars.get(&cap[1]).cloned().unwrap_or_default()
            });
            Value::String(out.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_nested_placeholders() {
        let tpl = Template::parse(vec![
            json!({"type": "text", "text": "Hi {{name}}, thanks for {{ item }}!"}),
            json!({"type": "template", "altText": "{{name}}", "template": {"actions": [{"label": "See {{item}}"}]}, "n": 3}),
        ])
        .unwrap();
        assert_eq!(
            tpl.placeholders(),
            BTreeSet::from(["item".to_string(), "name".to_string()])
        );

        let payload = tpl.render(&vars(&[("name", "Aki"), ("item", "tea")])).unwrap();
        assert_eq!(payload.messages[0]["text"], "Hi Aki, thanks for tea!");
        assert_eq!(payload.messages[1]["altText"], "Aki");
        assert_eq!(
            payload.messages[1]["template"]["actions"][0]["label"],
            "See tea"
        );
        assert_eq!(payload.messages[1]["n"], 3);
    }

    #[test]
    fn substituted_values_are_not_reexpanded() {
        let tpl = Template::parse(vec![json!({"text": "{{a}}"})]).unwrap();
        let payload = tpl.render(&vars(&[("a", "{{b}}")])).unwrap();
        assert_eq!(payload.messages[0]["text"], "{{b}}");
    }

    #[test]
    fn rejects_malformed_templates() {
        assert_eq!(Template::parse(vec![]), Err(TemplateError::Empty));
        assert!(matches!(
            Template::parse(vec![json!({}); 6]),
            Err(TemplateError::TooMany { count: 6, max: 5 })
        ));
        assert_eq!(
            Template::parse(vec![json!("plain")]),
            Err(TemplateError::NotObject(0))
        );
        assert!(matches!(
            Template::parse(vec![json!({"text": "Hi {{name"})]),
            Err(TemplateError::Malformed(_))
        ));
        assert!(matches!(
            Template::parse(vec![json!({"text": "Hi {{first name}}"})]),
            Err(TemplateError::Malformed(_))
        ));
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let tpl = Template::parse(vec![json!({"text": "{{coupon}}"})]).unwrap();
        assert_eq!(
            tpl.render(&BTreeMap::new()),
            Err(TemplateError::Unresolved("coupon".into()))
        );
    }
}
