//! `{{placeholder}}` rendering for step dispatch text.
//!
//! A placeholder is a dotted path. The first segment names a workflow
//! variable or a completed step's response data; the rest walks into
//! objects (and arrays by index). Unresolved placeholders render empty and
//! an unclosed `{{` is kept as literal text.

use serde_json::{Map, Value};

pub fn render(template: &str, variables: &Map<String, Value>, data: &Map<String, Value>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        rendered.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            rendered.push_str(&rest[open..]);
            return rendered;
        };

        let expression = after_open[..close].trim();
        match resolve(expression, variables, data) {
            Some(Value::String(text)) => rendered.push_str(text),
            Some(Value::Null) | None => {}
            Some(other) => rendered.push_str(&other.to_string()),
        }
        rest = &after_open[close + 2..];
    }

    rendered.push_str(rest);
    rendered
}

fn resolve<'a>(
    expression: &str,
    variables: &'a Map<String, Value>,
    data: &'a Map<String, Value>,
) -> Option<&'a Value> {
    if expression.is_empty() {
        return None;
    }
    if let Some(value) = variables.get(expression) {
        return Some(value);
    }

    let mut segments = expression.split('.');
    let head = segments.next()?;
    let mut current = variables.get(head).or_else(|| data.get(head))?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
