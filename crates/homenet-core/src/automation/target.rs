//! Command-target strings: `"id(E).command_NAME(arg?)"`.

use crate::{CoreError, Value};

/// A parsed command target.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTarget {
    /// Entity id inside `id(...)`.
    pub entity_id: String,
    /// Command name after `command_`.
    pub command: String,
    /// Optional argument.
    pub arg: Option<TargetArg>,
}

/// The argument inside the trailing parentheses.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetArg {
    /// A literal number, boolean, or quoted string.
    Literal(Value),
    /// An expression evaluated with the invocation's bindings.
    Expr(String),
}

impl CommandTarget {
    /// Parse a target string.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let fail = |reason: &'static str| CoreError::InvalidTarget {
            target: input.to_owned(),
            reason,
        };

        let rest = input.trim();
        let rest = rest.strip_prefix("id(").ok_or_else(|| fail("expected id(...)"))?;
        let (entity_id, rest) =
            rest.split_once(')').ok_or_else(|| fail("unterminated id(...)"))?;
        let entity_id = entity_id.trim();
        if entity_id.is_empty() {
            return Err(fail("empty entity id"));
        }

        let rest = rest
            .strip_prefix(".command_")
            .ok_or_else(|| fail("expected .command_NAME"))?;
        let (command, rest) =
            rest.split_once('(').ok_or_else(|| fail("expected (arg) after command name"))?;
        if command.is_empty()
            || !command.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(fail("invalid command name"));
        }
        let arg = rest.strip_suffix(')').ok_or_else(|| fail("unterminated argument"))?.trim();
        let arg = if arg.is_empty() { None } else { Some(parse_arg(arg)) };
        Ok(Self { entity_id: entity_id.to_owned(), command: command.to_owned(), arg })
    }
}

/// Literal if it reads as one, expression otherwise.
fn parse_arg(arg: &str) -> TargetArg {
    if let Some(text) = quoted(arg, '\'').or_else(|| quoted(arg, '"')) {
        return TargetArg::Literal(Value::from(text));
    }
    match arg {
        "true" => return TargetArg::Literal(Value::Bool(true)),
        "false" => return TargetArg::Literal(Value::Bool(false)),
        _ => {},
    }
    if let Ok(n) = arg.parse::<i64>() {
        return TargetArg::Literal(Value::Int(n));
    }
    if let Ok(n) = arg.parse::<f64>() {
        return TargetArg::Literal(Value::Float(n));
    }
    TargetArg::Expr(arg.to_owned())
}

fn quoted(arg: &str, quote: char) -> Option<&str> {
    arg.strip_prefix(quote)?.strip_suffix(quote)
}
