use digest_common::value::Value;

use crate::parser::{Arg, Expr, Node, Path};
use crate::{Escape, RenderError, Renderer};

/// One level of scope: the current value plus loop-local `@` variables.
struct Frame {
    value: Value,
    locals: Vec<(&'static str, Value)>,
}

pub(crate) fn render(
    renderer: &Renderer,
    nodes: &[Node],
    context: &Value,
) -> Result<String, RenderError> {
    let mut frames = vec![Frame {
        value: context.clone(),
        locals: Vec::new(),
    }];
    let mut out = String::new();
    render_nodes(renderer, nodes, &mut frames, &mut out)?;
    Ok(out)
}

fn render_nodes(
    renderer: &Renderer,
    nodes: &[Node],
    frames: &mut Vec<Frame>,
    out: &mut String,
) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Output { expr, escape } => {
                let value = eval(renderer, expr, frames)?;
                let text = value.to_string();
                if *escape && renderer.escape == Escape::Html {
                    push_escaped(out, &text);
                } else {
                    out.push_str(&text);
                }
            }
            Node::Conditional {
                condition,
                negate,
                then,
                otherwise,
            } => {
                let truthy = lookup(condition, frames)
                    .map(|v| v.is_truthy())
                    .unwrap_or(false);
                let branch = if truthy != *negate { then } else { otherwise };
                render_nodes(renderer, branch, frames, out)?;
            }
            Node::Each {
                target,
                body,
                otherwise,
            } => {
                let items = iteration_items(lookup(target, frames));
                if items.is_empty() {
                    render_nodes(renderer, otherwise, frames, out)?;
                    continue;
                }

                let last = items.len() - 1;
                for (index, (key, item)) in items.into_iter().enumerate() {
                    let mut locals = vec![
                        ("@index", Value::from(index)),
                        ("@first", Value::Bool(index == 0)),
                        ("@last", Value::Bool(index == last)),
                    ];
                    if let Some(key) = key {
                        locals.push(("@key", Value::String(key)));
                    }
                    frames.push(Frame {
                        value: item,
                        locals,
                    });
                    let result = render_nodes(renderer, body, frames, out);
                    frames.pop();
                    result?;
                }
            }
        }
    }
    Ok(())
}

/// Elements to iterate for `#each`: sequence items, or mapping entries with
/// their keys. Anything else iterates zero times.
fn iteration_items(value: Option<Value>) -> Vec<(Option<String>, Value)> {
    match value {
        Some(Value::Sequence(items)) => items.into_iter().map(|v| (None, v)).collect(),
        Some(Value::Mapping(map)) => map.into_iter().map(|(k, v)| (Some(k), v)).collect(),
        _ => Vec::new(),
    }
}

fn eval(renderer: &Renderer, expr: &Expr, frames: &[Frame]) -> Result<Value, RenderError> {
    match expr {
        Expr::Path(path) => {
            lookup(path, frames).ok_or_else(|| RenderError::MissingValue(path.to_string()))
        }
        Expr::Helper { name, args } => {
            let helper = renderer
                .helpers
                .get(name)
                .ok_or_else(|| RenderError::Helper(format!("unknown helper '{}'", name)))?;

            let args = args
                .iter()
                .map(|arg| match arg {
                    Arg::Literal(s) => Ok(Value::String(s.clone())),
                    Arg::Number(n) => Ok(Value::Number(n.clone())),
                    Arg::Path(path) => lookup(path, frames)
                        .ok_or_else(|| RenderError::MissingValue(path.to_string())),
                })
                .collect::<Result<Vec<_>, _>>()?;

            helper.call(&args, renderer.now)
        }
    }
}

/// Resolve a path against the scope stack. `None` means the path does not
/// exist; an explicit null resolves to `Some(Value::Absent)`.
fn lookup(path: &Path, frames: &[Frame]) -> Option<Value> {
    let depth = frames.len().checked_sub(1 + path.parents)?;
    let frame = &frames[depth];

    let mut segments = path.segments.iter();
    let mut current = match segments.clone().next() {
        None => return Some(frame.value.clone()),
        Some(first) if first == "@root" => {
            segments.next();
            frames[0].value.clone()
        }
        Some(first) if first.starts_with('@') => {
            segments.next();
            frame
                .locals
                .iter()
                .find(|(name, _)| *name == first.as_str())
                .map(|(_, v)| v.clone())?
        }
        Some(_) => frame.value.clone(),
    };

    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '`' => out.push_str("&#x60;"),
            '=' => out.push_str("&#x3D;"),
            _ => out.push(c),
        }
    }
}
