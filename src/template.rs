//! Minimal `{{.name}}` substitution templates
//!
//! Templates come from configuration, so only plain variable references are
//! evaluated. Any other action is kept verbatim in the output.

use crate::telemetry::AttributeValue;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn action_regex() -> &'static Regex {
    static ACTION: OnceLock<Regex> = OnceLock::new();
    ACTION.get_or_init(|| {
        Regex::new(r"\{\{-?\s*(.*?)\s*-?\}\}").expect("template action regex is valid")
    })
}

fn variable_regex() -> &'static Regex {
    static VARIABLE: OnceLock<Regex> = OnceLock::new();
    VARIABLE.get_or_init(|| {
        Regex::new(r"^\.([A-Za-z_][A-Za-z0-9_]*)$").expect("template variable regex is valid")
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A compiled payload template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
    issues: Vec<String>,
}

impl Template {
    /// Compile a template. Never fails; unsupported actions and unbalanced
    /// delimiters are recorded in [`Template::issues`] and rendered literally.
    pub fn compile(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut issues = Vec::new();
        let mut cursor = 0;

        for captures in action_regex().captures_iter(source) {
            let (Some(whole), Some(body)) = (captures.get(0), captures.get(1)) else {
                continue;
            };

            if whole.start() > cursor {
                segments.push(Segment::Literal(source[cursor..whole.start()].to_string()));
            }

            match variable_regex().captures(body.as_str()).and_then(|c| c.get(1)) {
                Some(name) => segments.push(Segment::Variable(name.as_str().to_string())),
                None => {
                    issues.push(format!("unsupported template action `{}`", whole.as_str()));
                    segments.push(Segment::Literal(whole.as_str().to_string()));
                }
            }

            cursor = whole.end();
        }

        if cursor < source.len() {
            let rest = &source[cursor..];
            if rest.contains("{{") {
                issues.push("unterminated template action".to_string());
            }
            segments.push(Segment::Literal(rest.to_string()));
        }

        Self { segments, issues }
    }

    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    /// Names of all variables referenced by the template
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Variable(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Render against `variables`. Missing variables render as empty text.
    pub fn render(&self, variables: &HashMap<String, AttributeValue>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => {
                    if let Some(value) = variables.get(name) {
                        out.push_str(&value.to_string());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, AttributeValue)]) -> HashMap<String, AttributeValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_renders_variables() {
        let template = Template::compile("{{.method}} {{.url}}");
        let rendered = template.render(&vars(&[
            ("method", AttributeValue::from("GET")),
            ("url", AttributeValue::from("/x")),
        ]));
        assert_eq!(rendered, "GET /x");
        assert!(template.issues().is_empty());
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        let template = Template::compile("status={{ .code }} path={{.url}}");
        let rendered = template.render(&vars(&[("url", AttributeValue::from("/y"))]));
        assert_eq!(rendered, "status= path=/y");
    }

    #[test]
    fn test_non_string_values() {
        let template = Template::compile("{{.code}} took {{.latency}}");
        let rendered = template.render(&vars(&[
            ("code", AttributeValue::Int64(404)),
            ("latency", AttributeValue::Duration(std::time::Duration::from_millis(1500))),
        ]));
        assert_eq!(rendered, "404 took 1.5s");
    }

    #[test]
    fn test_unsupported_actions_stay_literal() {
        let template = Template::compile("{{range .items}}x{{end}} {{.name}} {{oops");
        assert_eq!(template.issues().len(), 3);
        assert_eq!(template.variables().collect::<Vec<_>>(), vec!["name"]);

        let rendered = template.render(&vars(&[("name", AttributeValue::from("n"))]));
        assert_eq!(rendered, "{{range .items}}x{{end}} n {{oops");
    }
}
