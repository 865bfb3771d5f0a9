//! `${...}` expressions inside declaration strings.

use std::collections::BTreeMap;

use crate::resource::{InstanceKey, Reference, Segment, Target, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(usize),
    Str(String),
    Dot,
    Star,
    LBracket,
    RBracket,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Accessor {
    Field(String),
    Index(usize),
    Key(String),
    Splat,
    /// `[expr]`, resolved to an index or key against the scope.
    Computed(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Path { root: String, accessors: Vec<Accessor> },
    Call { function: String, argument: Box<Expr> },
}

/// What an expression evaluates to before the resource graph exists.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Evaluated {
    Json(serde_json::Value),
    Reference(Reference),
}

/// Bindings visible to expressions in one resource instance.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope<'a> {
    pub variables: Option<&'a BTreeMap<String, serde_json::Value>>,
    pub count_index: Option<usize>,
    pub each: Option<(&'a str, &'a serde_json::Value)>,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => text.push(escaped),
                            None => return Err("unterminated string".to_string()),
                        },
                        Some(ch) => text.push(ch),
                        None => return Err("unterminated string".to_string()),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                let number = digits
                    .parse()
                    .map_err(|_| format!("number '{}' is out of range", digits))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if !(d.is_ascii_alphanumeric() || d == '_' || d == '-') {
                        break;
                    }
                    ident.push(d);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {:?}, found {:?}", expected, token)),
            None => Err(format!("expected {:?}, found end of expression", expected)),
        }
    }

    fn expression(&mut self) -> Result<Expr, String> {
        let root = match self.next() {
            Some(Token::Ident(ident)) => ident,
            Some(token) => return Err(format!("expected a name, found {:?}", token)),
            None => return Err("empty expression".to_string()),
        };

        if self.peek() == Some(&Token::LParen) {
            self.next();
            let argument = self.expression()?;
            self.expect(Token::RParen)?;
            return Ok(Expr::Call {
                function: root,
                argument: Box::new(argument),
            });
        }

        let mut accessors = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(field)) => accessors.push(Accessor::Field(field)),
                        Some(Token::Number(index)) => accessors.push(Accessor::Index(index)),
                        Some(Token::Star) => accessors.push(Accessor::Splat),
                        other => return Err(format!("expected a field name, found {:?}", other)),
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let accessor = match self.peek().cloned() {
                        Some(Token::Number(index)) => {
                            self.next();
                            Accessor::Index(index)
                        }
                        Some(Token::Str(key)) => {
                            self.next();
                            Accessor::Key(key)
                        }
                        Some(Token::Star) => {
                            self.next();
                            Accessor::Splat
                        }
                        Some(Token::Ident(_)) => Accessor::Computed(Box::new(self.expression()?)),
                        other => {
                            return Err(format!("expected an index, key, * or expression, found {:?}", other));
                        }
                    };
                    self.expect(Token::RBracket)?;
                    accessors.push(accessor);
                }
                _ => break,
            }
        }
        Ok(Expr::Path { root, accessors })
    }
}

pub(crate) fn parse(input: &str) -> Result<Expr, String> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        position: 0,
    };
    let expr = parser.expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("unexpected {:?} after expression", token)),
    }
}

pub(crate) fn evaluate(expr: &Expr, scope: &Scope<'_>) -> Result<Evaluated, String> {
    match expr {
        Expr::Call { function, argument } => match function.as_str() {
            "length" => match evaluate(argument, scope)? {
                Evaluated::Json(serde_json::Value::Array(items)) => Ok(json(items.len())),
                Evaluated::Json(serde_json::Value::Object(entries)) => Ok(json(entries.len())),
                Evaluated::Json(serde_json::Value::String(text)) => Ok(json(text.chars().count())),
                Evaluated::Json(other) => Err(format!("length() does not apply to {}", other)),
                Evaluated::Reference(reference) => Err(format!(
                    "length() needs a value known before apply, not {}",
                    reference
                )),
            },
            other => Err(format!("unknown function '{}'", other)),
        },
        Expr::Path { root, accessors } => {
            let accessors = resolve_accessors(accessors, scope)?;
            evaluate_path(root, &accessors, scope)
        }
    }
}

fn evaluate_path(root: &str, accessors: &[Accessor], scope: &Scope<'_>) -> Result<Evaluated, String> {
    match root {
        "var" => {
            let (name, rest) = split_field(accessors, "var")?;
            let value = scope
                .variables
                .and_then(|vars| vars.get(name))
                .ok_or_else(|| format!("variable '{}' is not defined", name))?;
            Ok(Evaluated::Json(access(value, rest, &format!("var.{}", name))?))
        }
        "count" => match accessors {
            [Accessor::Field(field)] if field == "index" => scope
                .count_index
                .map(json)
                .ok_or_else(|| "count.index used in a resource without count".to_string()),
            _ => Err("only count.index is available".to_string()),
        },
        "each" => {
            let (key, value) = scope
                .each
                .ok_or_else(|| "each used in a resource without for_each".to_string())?;
            match accessors.split_first() {
                Some((Accessor::Field(field), [])) if field == "key" => Ok(json(key)),
                Some((Accessor::Field(field), rest)) if field == "value" => {
                    Ok(Evaluated::Json(access(value, rest, "each.value")?))
                }
                _ => Err("only each.key and each.value are available".to_string()),
            }
        }
        resource_type => resource_reference(resource_type, accessors).map(Evaluated::Reference),
    }
}

fn resolve_accessors(accessors: &[Accessor], scope: &Scope<'_>) -> Result<Vec<Accessor>, String> {
    accessors
        .iter()
        .map(|accessor| match accessor {
            Accessor::Computed(expr) => match evaluate(expr, scope)? {
                Evaluated::Json(serde_json::Value::Number(number)) => number
                    .as_u64()
                    .and_then(|n| usize::try_from(n).ok())
                    .map(Accessor::Index)
                    .ok_or_else(|| format!("index {} is not a non-negative integer", number)),
                Evaluated::Json(serde_json::Value::String(key)) => Ok(Accessor::Key(key)),
                Evaluated::Json(other) => Err(format!("{} cannot be used as an index or key", other)),
                Evaluated::Reference(reference) => {
                    Err(format!("index {} is not known before apply", reference))
                }
            },
            other => Ok(other.clone()),
        })
        .collect()
}

fn json(value: impl Into<serde_json::Value>) -> Evaluated {
    Evaluated::Json(value.into())
}

fn split_field<'a>(accessors: &'a [Accessor], root: &str) -> Result<(&'a str, &'a [Accessor]), String> {
    match accessors.split_first() {
        Some((Accessor::Field(name), rest)) => Ok((name, rest)),
        _ => Err(format!("expected {}.NAME", root)),
    }
}

fn access(value: &serde_json::Value, accessors: &[Accessor], path: &str) -> Result<serde_json::Value, String> {
    let mut current = value;
    for accessor in accessors {
        current = match (accessor, current) {
            (Accessor::Index(index), serde_json::Value::Array(items)) => items
                .get(*index)
                .ok_or_else(|| format!("{} has no element {}", path, index))?,
            (Accessor::Key(key) | Accessor::Field(key), serde_json::Value::Object(entries)) => entries
                .get(key)
                .ok_or_else(|| format!("{} has no key '{}'", path, key))?,
            (accessor, _) => return Err(format!("cannot apply {:?} to {}", accessor, path)),
        };
    }
    Ok(current.clone())
}

fn resource_reference(resource_type: &str, accessors: &[Accessor]) -> Result<Reference, String> {
    let (name, rest) = split_field(accessors, resource_type)?;
    let (selector, rest) = match rest.split_first() {
        Some((Accessor::Index(index), rest)) => (Some(InstanceKey::Index(*index)), rest),
        Some((Accessor::Key(key), rest)) => (Some(InstanceKey::Key(key.clone())), rest),
        Some((Accessor::Splat, rest)) => {
            let attribute = single_attribute(rest, resource_type, name)?;
            return Ok(Reference::new(Target::all(resource_type, name), attribute));
        }
        _ => (None, rest),
    };
    let attribute = single_attribute(rest, resource_type, name)?;
    let target = match selector {
        Some(key) => Target::instance(resource_type, name, key),
        None => Target::single(resource_type, name),
    };
    Ok(Reference::new(target, attribute))
}

fn single_attribute(rest: &[Accessor], resource_type: &str, name: &str) -> Result<String, String> {
    match rest {
        [Accessor::Field(attribute)] => Ok(attribute.clone()),
        _ => Err(format!(
            "expected {}.{}.ATTRIBUTE (nested attribute access is not supported)",
            resource_type, name
        )),
    }
}

/// Parses a `depends_on` entry such as `network.main` or `subnet.public[*]`.
pub(crate) fn parse_target(input: &str, scope: &Scope<'_>) -> Result<Target, String> {
    let Expr::Path { root, accessors } = parse(input)? else {
        return Err("expected TYPE.NAME".to_string());
    };
    let accessors = resolve_accessors(&accessors, scope)?;
    let (name, rest) = split_field(&accessors, &root)?;
    match rest {
        [] => Ok(Target::single(&root, name)),
        [Accessor::Index(index)] => Ok(Target::instance(&root, name, InstanceKey::Index(*index))),
        [Accessor::Key(key)] => Ok(Target::instance(&root, name, InstanceKey::Key(key.clone()))),
        [Accessor::Splat] => Ok(Target::all(&root, name)),
        _ => Err("expected TYPE.NAME with an optional [index], [\"key\"] or [*]".to_string()),
    }
}

enum Piece<'a> {
    Text(String),
    Expr(&'a str),
}

fn split_template(input: &str) -> Result<Vec<Piece<'_>>, String> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        // NOTE: `$${` is an escaped literal `${`.
        if rest[..start].ends_with('$') {
            text.push_str(&rest[..start - 1]);
            text.push_str("${");
            rest = &rest[start + 2..];
            continue;
        }
        text.push_str(&rest[..start]);
        let body = &rest[start + 2..];
        let end = body
            .find('}')
            .ok_or_else(|| "unterminated ${ in string".to_string())?;
        if !text.is_empty() {
            pieces.push(Piece::Text(std::mem::take(&mut text)));
        }
        pieces.push(Piece::Expr(body[..end].trim()));
        rest = &body[end + 1..];
    }
    text.push_str(rest);
    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    Ok(pieces)
}

/// Converts a declaration string into a [`Value`].
///
/// A string that is exactly one expression keeps the expression's JSON type.
/// Anything else becomes text, with references kept as template segments.
pub(crate) fn interpolate(input: &str, scope: &Scope<'_>) -> Result<Value, String> {
    let pieces = split_template(input)?;

    if let [Piece::Expr(source)] = pieces.as_slice() {
        return match evaluate(&parse(source)?, scope)? {
            Evaluated::Json(value) => Ok(Value::Literal(value)),
            Evaluated::Reference(reference) => Ok(Value::Reference(reference)),
        };
    }

    let mut segments: Vec<Segment> = Vec::new();
    for piece in pieces {
        match piece {
            Piece::Text(text) => push_text(&mut segments, &text),
            Piece::Expr(source) => match evaluate(&parse(source)?, scope)? {
                Evaluated::Json(serde_json::Value::String(text)) => push_text(&mut segments, &text),
                Evaluated::Json(other) => push_text(&mut segments, &other.to_string()),
                Evaluated::Reference(reference) => segments.push(Segment::Reference(reference)),
            },
        }
    }

    match segments.as_slice() {
        [] => Ok(Value::literal("")),
        [Segment::Text(text)] => Ok(Value::literal(text.clone())),
        _ => Ok(Value::Template(segments)),
    }
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if let Some(Segment::Text(last)) = segments.last_mut() {
        last.push_str(text);
    } else {
        segments.push(Segment::Text(text.to_string()));
    }
}
