//! Template compiler: turns template text into a tree of [`Node`]s.

use digest_common::value::Number;

use crate::RenderError;

/// A reference into the render context, e.g. `../data.rows.length`.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    /// Number of `../` prefixes.
    pub parents: usize,
    /// Dotted segments after `this`/`../` are stripped. May start with an
    /// `@`-variable such as `@index`.
    pub segments: Vec<String>,
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for _ in 0..self.parents {
            f.write_str("../")?;
        }
        if self.segments.is_empty() {
            f.write_str("this")
        } else {
            f.write_str(&self.segments.join("."))
        }
    }
}

/// A helper argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(String),
    Number(Number),
    Path(Path),
}

/// The expression inside a mustache tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Path(Path),
    Helper { name: String, args: Vec<Arg> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    /// `{{expr}}` (escaped) or `{{{expr}}}` (raw).
    Output { expr: Expr, escape: bool },
    /// `{{#if}}` / `{{#unless}}`.
    Conditional {
        condition: Path,
        negate: bool,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    /// `{{#each}}`.
    Each {
        target: Path,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug)]
enum Token {
    Text(String),
    Output { words: Vec<Word>, escape: bool },
    Open { block: String, words: Vec<Word> },
    Else,
    Close(String),
}

#[derive(Debug, Clone)]
enum Word {
    Bare(String),
    Quoted(String),
}

/// Compile template text into nodes.
pub fn parse(source: &str) -> Result<Vec<Node>, RenderError> {
    let tokens = tokenize(source)?;
    let mut pos = 0;
    let (nodes, terminator) = parse_nodes(&tokens, &mut pos)?;
    match terminator {
        None => Ok(nodes),
        Some(Terminator::Else) => Err(RenderError::Syntax(
            "{{else}} outside of a block".to_string(),
        )),
        Some(Terminator::Close(name)) => Err(RenderError::Syntax(format!(
            "unexpected {{{{/{}}}}} without matching open block",
            name
        ))),
    }
}

enum Terminator {
    Else,
    Close(String),
}

fn parse_nodes(
    tokens: &[Token],
    pos: &mut usize,
) -> Result<(Vec<Node>, Option<Terminator>), RenderError> {
    let mut nodes = Vec::new();

    while let Some(token) = tokens.get(*pos) {
        *pos += 1;
        match token {
            Token::Text(text) => nodes.push(Node::Text(text.clone())),
            Token::Output { words, escape } => nodes.push(Node::Output {
                expr: parse_expr(words)?,
                escape: *escape,
            }),
            Token::Else => return Ok((nodes, Some(Terminator::Else))),
            Token::Close(name) => return Ok((nodes, Some(Terminator::Close(name.clone())))),
            Token::Open { block, words } => nodes.push(parse_block(block, words, tokens, pos)?),
        }
    }

    Ok((nodes, None))
}

fn parse_block(
    block: &str,
    words: &[Word],
    tokens: &[Token],
    pos: &mut usize,
) -> Result<Node, RenderError> {
    if !matches!(block, "if" | "unless" | "each") {
        return Err(RenderError::Syntax(format!(
            "unknown block helper '#{}'",
            block
        )));
    }

    let target = match words {
        [Word::Bare(path)] => parse_path(path)?,
        _ => {
            return Err(RenderError::Syntax(format!(
                "'#{}' expects exactly one path argument",
                block
            )));
        }
    };

    let (body, terminator) = parse_nodes(tokens, pos)?;
    let otherwise = match terminator {
        Some(Terminator::Else) => {
            let (otherwise, terminator) = parse_nodes(tokens, pos)?;
            expect_close(block, terminator)?;
            otherwise
        }
        other => {
            expect_close(block, other)?;
            Vec::new()
        }
    };

    Ok(match block {
        "each" => Node::Each {
            target,
            body,
            otherwise,
        },
        _ => Node::Conditional {
            condition: target,
            negate: block == "unless",
            then: body,
            otherwise,
        },
    })
}

fn expect_close(block: &str, terminator: Option<Terminator>) -> Result<(), RenderError> {
    match terminator {
        Some(Terminator::Close(name)) if name == block => Ok(()),
        Some(Terminator::Close(name)) => Err(RenderError::Syntax(format!(
            "'#{}' closed by '/{}'",
            block, name
        ))),
        Some(Terminator::Else) => Err(RenderError::Syntax(format!(
            "'#{}' has more than one {{{{else}}}}",
            block
        ))),
        None => Err(RenderError::Syntax(format!("unclosed '#{}' block", block))),
    }
}

fn parse_expr(words: &[Word]) -> Result<Expr, RenderError> {
    match words {
        [] => Err(RenderError::Syntax("empty expression".to_string())),
        [Word::Bare(path)] => Ok(Expr::Path(parse_path(path)?)),
        [Word::Quoted(_)] => Err(RenderError::Syntax(
            "a string literal cannot be output on its own".to_string(),
        )),
        [Word::Bare(name), rest @ ..] => {
            let args = rest.iter().map(parse_arg).collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::Helper {
                name: name.clone(),
                args,
            })
        }
        [Word::Quoted(_), ..] => Err(RenderError::Syntax(
            "expression must start with a helper name".to_string(),
        )),
    }
}

fn parse_arg(word: &Word) -> Result<Arg, RenderError> {
    match word {
        Word::Quoted(s) => Ok(Arg::Literal(s.clone())),
        Word::Bare(s) => match s.parse::<Number>() {
            Ok(n) => Ok(Arg::Number(n)),
            Err(_) => Ok(Arg::Path(parse_path(s)?)),
        },
    }
}

fn parse_path(raw: &str) -> Result<Path, RenderError> {
    let mut rest = raw;
    let mut parents = 0;
    while let Some(stripped) = rest.strip_prefix("../") {
        parents += 1;
        rest = stripped;
    }

    let mut segments: Vec<String> = Vec::new();
    for (i, segment) in rest.split('.').enumerate() {
        if segment.is_empty() {
            return Err(RenderError::Syntax(format!("invalid path '{}'", raw)));
        }
        if i == 0 && segment == "this" {
            continue;
        }
        if segment.starts_with('@') && i != 0 {
            return Err(RenderError::Syntax(format!(
                "'{}' may only start a path in '{}'",
                segment, raw
            )));
        }
        segments.push(segment.to_string());
    }

    Ok(Path { parents, segments })
}

fn tokenize(source: &str) -> Result<Vec<Token>, RenderError> {
    let mut tokens = Vec::new();
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            tokens.push(Token::Text(rest[..start].to_string()));
        }
        rest = &rest[start..];

        let (raw, open_len, close) = if rest.starts_with("{{{") {
            (true, 3, "}}}")
        } else if rest.starts_with("{{!--") {
            (false, 5, "--}}")
        } else {
            (false, 2, "}}")
        };

        let body = &rest[open_len..];
        let comment = open_len == 5 || body.trim_start().starts_with('!');
        let end = find_close(body, close, !comment).ok_or_else(|| {
            RenderError::Syntax(format!(
                "unterminated tag starting at '{}'",
                rest.chars().take(20).collect::<String>()
            ))
        })?;
        let inner = rest[open_len..open_len + end].trim();
        rest = &rest[open_len + end + close.len()..];

        if comment {
            continue;
        }

        tokens.push(classify_tag(inner, raw)?);
    }

    if !rest.is_empty() {
        tokens.push(Token::Text(rest.to_string()));
    }

    Ok(tokens)
}

/// Byte offset of the first `close` in `body`. With `skip_quoted`, a
/// `close` inside a quoted argument does not end the tag.
fn find_close(body: &str, close: &str, skip_quoted: bool) -> Option<usize> {
    if !skip_quoted {
        return body.find(close);
    }

    let mut quote = None;
    for (i, c) in body.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if body[i..].starts_with(close) => return Some(i),
            None => {}
        }
    }
    None
}

fn classify_tag(inner: &str, raw: bool) -> Result<Token, RenderError> {
    if raw {
        return Ok(Token::Output {
            words: split_words(inner)?,
            escape: false,
        });
    }

    if let Some(open) = inner.strip_prefix('#') {
        let mut words = split_words(open)?;
        if words.is_empty() {
            return Err(RenderError::Syntax("block tag without a name".to_string()));
        }
        let block = match words.remove(0) {
            Word::Bare(name) => name,
            Word::Quoted(_) => {
                return Err(RenderError::Syntax("block name cannot be quoted".to_string()));
            }
        };
        return Ok(Token::Open { block, words });
    }

    if let Some(close) = inner.strip_prefix('/') {
        return Ok(Token::Close(close.trim().to_string()));
    }

    if inner == "else" {
        return Ok(Token::Else);
    }

    Ok(Token::Output {
        words: split_words(inner)?,
        escape: true,
    })
}

/// Split tag contents on whitespace, keeping single- or double-quoted
/// strings together.
fn split_words(inner: &str) -> Result<Vec<Word>, RenderError> {
    let mut words = Vec::new();
    let mut chars = inner.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '\'' || c == '"' {
            chars.next();
            let mut literal = String::new();
            let mut closed = false;
            for ch in chars.by_ref() {
                if ch == c {
                    closed = true;
                    break;
                }
                literal.push(ch);
            }
            if !closed {
                return Err(RenderError::Syntax(format!(
                    "unterminated string literal in '{}'",
                    inner
                )));
            }
            words.push(Word::Quoted(literal));
        } else {
            let mut bare = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                bare.push(ch);
                chars.next();
            }
            words.push(Word::Bare(bare));
        }
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(parents: usize, segments: &[&str]) -> Path {
        Path {
            parents,
            segments: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_text_and_output() {
        let nodes = parse("{{data.rows.length}} crimes").unwrap();
        assert_eq!(
            nodes,
            vec![
                Node::Output {
                    expr: Expr::Path(path(0, &["data", "rows", "length"])),
                    escape: true,
                },
                Node::Text(" crimes".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_helper_with_quoted_args() {
        let nodes = parse("{{formatDate '2 days ago' \"YYYY-MM-DD\"}}").unwrap();
        assert_eq!(
            nodes,
            vec![Node::Output {
                expr: Expr::Helper {
                    name: "formatDate".to_string(),
                    args: vec![
                        Arg::Literal("2 days ago".to_string()),
                        Arg::Literal("YYYY-MM-DD".to_string()),
                    ],
                },
                escape: true,
            }]
        );
    }

    #[test]
    fn test_closing_braces_inside_quotes_do_not_end_tag() {
        let nodes = parse("{{formatDate 'today' '[}}] YYYY'}} end").unwrap();
        assert_eq!(
            nodes,
            vec![
                Node::Output {
                    expr: Expr::Helper {
                        name: "formatDate".to_string(),
                        args: vec![
                            Arg::Literal("today".to_string()),
                            Arg::Literal("[}}] YYYY".to_string()),
                        ],
                    },
                    escape: true,
                },
                Node::Text(" end".to_string()),
            ]
        );

        // Apostrophes in comments are not quotes.
        assert_eq!(parse("{{! don't }}x").unwrap(), vec![Node::Text("x".to_string())]);
    }

    #[test]
    fn test_numeric_arguments_keep_integer_precision() {
        let nodes = parse("{{pad 9007199254740993 1.5}}").unwrap();
        match &nodes[0] {
            Node::Output {
                expr: Expr::Helper { args, .. },
                ..
            } => {
                assert_eq!(args[0], Arg::Number(Number::from(9007199254740993u64)));
                assert_eq!(args[1], Arg::Number(Number::from_f64(1.5).unwrap()));
            }
            other => panic!("expected helper, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_this_and_parent_paths() {
        assert_eq!(parse_path("this").unwrap(), path(0, &[]));
        assert_eq!(parse_path("this.name").unwrap(), path(0, &["name"]));
        assert_eq!(parse_path("../title").unwrap(), path(1, &["title"]));
        assert_eq!(parse_path("@index").unwrap(), path(0, &["@index"]));
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("rows.@index").is_err());
    }

    #[test]
    fn test_parse_nested_blocks_with_else() {
        let nodes = parse("{{#if a}}{{#each b}}x{{else}}none{{/each}}{{else}}no{{/if}}").unwrap();
        match &nodes[0] {
            Node::Conditional {
                then, otherwise, ..
            } => {
                assert_eq!(otherwise, &vec![Node::Text("no".to_string())]);
                match &then[0] {
                    Node::Each { otherwise, .. } => {
                        assert_eq!(otherwise, &vec![Node::Text("none".to_string())]);
                    }
                    other => panic!("expected each, got {:?}", other),
                }
            }
            other => panic!("expected conditional, got {:?}", other),
        }
    }

    #[test]
    fn test_comments_are_dropped() {
        let nodes = parse("a{{! note }}b{{!-- {{not a tag}} --}}c").unwrap();
        assert_eq!(
            nodes,
            vec![
                Node::Text("a".to_string()),
                Node::Text("b".to_string()),
                Node::Text("c".to_string()),
            ]
        );
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse("{{#if a}}x"), Err(RenderError::Syntax(_))));
        assert!(matches!(parse("{{#if a}}x{{/each}}"), Err(RenderError::Syntax(_))));
        assert!(matches!(parse("x{{/if}}"), Err(RenderError::Syntax(_))));
        assert!(matches!(parse("{{else}}"), Err(RenderError::Syntax(_))));
        assert!(matches!(parse("{{#with a}}{{/with}}"), Err(RenderError::Syntax(_))));
        assert!(matches!(parse("{{name"), Err(RenderError::Syntax(_))));
        assert!(matches!(parse("{{f 'open}}"), Err(RenderError::Syntax(_))));
        assert!(matches!(parse("{{}}"), Err(RenderError::Syntax(_))));
    }
}
