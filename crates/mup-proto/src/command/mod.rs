//! Declarative command schema and free-text parser (spec §4.2).
//!
//! A [`CommandSchema`] is an ordered list of [`Argument`]s: positional
//! arguments absorbed in order, and named options introduced with a leading
//! `-`. Plugins declare a schema per command; [`CommandSchema::parse`] turns
//! a line of free text into a [`ParsedArgs`] map the plugin can bind into its
//! own argument struct.

mod value;

pub use self::value::{ArgKind, Value};

use crate::error::CommandParseError;

/// One declared argument: either a positional slot or a named option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Argument {
    /// The argument's name (used for named options and error messages; for
    /// positionals this is only used for error messages and bound-value
    /// lookup).
    pub name: String,
    /// The argument's kind: positional vs. named option, and its type.
    pub shape: ArgShape,
    /// Whether this argument must be supplied.
    pub required: bool,
}

/// Distinguishes positional arguments (consumed in declaration order from
/// the front of the input) from named options (`-name` / `-name=value`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArgShape {
    /// A positional argument. `trailing` absorbs the rest of the input
    /// verbatim (including spaces) instead of stopping at the next token;
    /// only the last positional in a schema may set this.
    Positional {
        /// Absorb the remainder of the input verbatim.
        trailing: bool,
    },
    /// A named option (`-name` for bool, `-name=value` for typed values).
    Option {
        /// The value type this option parses as.
        kind: ArgKind,
    },
}

impl Argument {
    /// Declare a required positional argument.
    pub fn positional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: ArgShape::Positional { trailing: false },
            required: true,
        }
    }

    /// Declare an optional positional argument.
    pub fn optional_positional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shape: ArgShape::Positional { trailing: false },
            required: false,
        }
    }

    /// Declare a trailing positional argument that absorbs the remainder of
    /// the input verbatim. Only valid as the last argument in a schema.
    pub fn trailing(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            shape: ArgShape::Positional { trailing: true },
            required,
        }
    }

    /// Declare a named option of the given type.
    pub fn option(name: impl Into<String>, kind: ArgKind, required: bool) -> Self {
        Self {
            name: name.into(),
            shape: ArgShape::Option { kind },
            required,
        }
    }
}

/// An ordered list of [`Argument`]s describing one command's grammar.
#[derive(Clone, Debug, Default)]
pub struct CommandSchema {
    /// The command name this schema parses (e.g. `echo`).
    pub name: String,
    args: Vec<Argument>,
}

impl CommandSchema {
    /// Start building a schema for the command named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument declaration.
    pub fn arg(mut self, arg: Argument) -> Self {
        self.args.push(arg);
        self
    }

    /// This schema's arguments, in declaration order. Used to persist a
    /// registry-declared schema into the store's `argumentschema` rows for
    /// the help system (§3 `Argumentschema`, §4.6).
    pub fn arguments(&self) -> &[Argument] {
        &self.args
    }

    /// Parse free text (the command's arguments, with the command name
    /// itself already stripped) against this schema.
    pub fn parse(&self, input: &str) -> Result<ParsedArgs, CommandParseError> {
        let mut values = std::collections::HashMap::new();
        let mut rest = input.trim_start();

        let positionals: Vec<&Argument> = self
            .args
            .iter()
            .filter(|a| matches!(a.shape, ArgShape::Positional { .. }))
            .collect();

        let mut positional_idx = 0;

        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                break;
            }

            if let Some(opt_text) = rest.strip_prefix('-') {
                let (token, remainder) = split_token(opt_text);
                let (name, inline_value) = match token.split_once('=') {
                    Some((n, v)) => (n, Some(v)),
                    None => (token, None),
                };

                let declared = self
                    .args
                    .iter()
                    .find(|a| a.name == name && matches!(a.shape, ArgShape::Option { .. }))
                    .ok_or_else(|| CommandParseError::UnknownArgument(name.to_owned()))?;

                let kind = match &declared.shape {
                    ArgShape::Option { kind } => *kind,
                    ArgShape::Positional { .. } => unreachable!(),
                };

                let raw_value = match (kind, inline_value) {
                    (ArgKind::Bool, None) => "true".to_owned(),
                    (_, Some(v)) => v.to_owned(),
                    (_, None) => return Err(CommandParseError::MissingValue(name.to_owned())),
                };

                let value = Value::parse(kind, &raw_value).map_err(|_| CommandParseError::CannotParse {
                    name: name.to_owned(),
                    kind: kind.label(),
                    value: raw_value.clone(),
                })?;

                values.insert(name.to_owned(), value);
                rest = remainder;
                continue;
            }

            let Some(arg) = positionals.get(positional_idx) else {
                return Err(CommandParseError::UnexpectedTrailing(rest.to_owned()));
            };

            let trailing = matches!(arg.shape, ArgShape::Positional { trailing: true });
            let (token, remainder) = if trailing {
                (rest.trim_end(), "")
            } else {
                split_token(rest)
            };

            values.insert(arg.name.clone(), Value::String(token.to_owned()));
            positional_idx += 1;
            rest = remainder;
        }

        for arg in &self.args {
            if arg.required && !values.contains_key(&arg.name) {
                return Err(CommandParseError::MissingRequired(arg.name.clone()));
            }
        }

        Ok(ParsedArgs { values })
    }
}

/// Split `-name` style tokens off the front of `input`, stopping at the
/// next unescaped space or the end of the string.
fn split_token(input: &str) -> (&str, &str) {
    match input.find(' ') {
        Some(idx) => (&input[..idx], input[idx..].trim_start()),
        None => (input, ""),
    }
}

/// The bound result of [`CommandSchema::parse`]: a name-to-value map.
#[derive(Clone, Debug, Default)]
pub struct ParsedArgs {
    values: std::collections::HashMap<String, Value>,
}

impl ParsedArgs {
    /// Fetch a bound string value by argument name.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Fetch a bound integer value by argument name.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Fetch a bound bool value by argument name; absent bool options are
    /// treated as `false`.
    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(Value::Bool(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_trailing_positional() {
        let schema = CommandSchema::new("echo").arg(Argument::trailing("text", true));
        let parsed = schema.parse("hello there, world").unwrap();
        assert_eq!(parsed.get_str("text"), Some("hello there, world"));
    }

    #[test]
    fn test_missing_required_positional() {
        let schema = CommandSchema::new("echo").arg(Argument::trailing("text", true));
        let err = schema.parse("   ").unwrap_err();
        assert_eq!(err, CommandParseError::MissingRequired("text".into()));
    }

    #[test]
    fn test_positional_then_trailing() {
        let schema = CommandSchema::new("tell")
            .arg(Argument::positional("who"))
            .arg(Argument::trailing("message", true));
        let parsed = schema.parse("bob go check the build").unwrap();
        assert_eq!(parsed.get_str("who"), Some("bob"));
        assert_eq!(parsed.get_str("message"), Some("go check the build"));
    }

    #[test]
    fn test_bare_bool_option() {
        let schema = CommandSchema::new("watch")
            .arg(Argument::option("verbose", ArgKind::Bool, false))
            .arg(Argument::trailing("repo", true));
        let parsed = schema.parse("-verbose my/repo").unwrap();
        assert!(parsed.get_bool("verbose"));
        assert_eq!(parsed.get_str("repo"), Some("my/repo"));
    }

    #[test]
    fn test_typed_option() {
        let schema = CommandSchema::new("limit").arg(Argument::option("n", ArgKind::Int, false));
        let parsed = schema.parse("-n=5").unwrap();
        assert_eq!(parsed.get_int("n"), Some(5));
    }

    #[test]
    fn test_unknown_argument() {
        let schema = CommandSchema::new("echo").arg(Argument::trailing("text", false));
        let err = schema.parse("-bogus=1 hi").unwrap_err();
        assert_eq!(err, CommandParseError::UnknownArgument("bogus".into()));
    }

    #[test]
    fn test_missing_value_for_typed_option() {
        let schema = CommandSchema::new("limit").arg(Argument::option("n", ArgKind::Int, false));
        let err = schema.parse("-n").unwrap_err();
        assert_eq!(err, CommandParseError::MissingValue("n".into()));
    }

    #[test]
    fn test_cannot_parse_as_type() {
        let schema = CommandSchema::new("limit").arg(Argument::option("n", ArgKind::Int, false));
        let err = schema.parse("-n=notanumber").unwrap_err();
        assert_eq!(
            err,
            CommandParseError::CannotParse {
                name: "n".into(),
                kind: "int",
                value: "notanumber".into(),
            }
        );
    }

    #[test]
    fn test_unexpected_trailing_input() {
        let schema = CommandSchema::new("ping").arg(Argument::positional("target"));
        let err = schema.parse("a b").unwrap_err();
        assert_eq!(err, CommandParseError::UnexpectedTrailing("b".into()));
    }

    #[test]
    fn test_utf8_identifiers() {
        let schema = CommandSchema::new("echo").arg(Argument::trailing("text", true));
        let parsed = schema.parse("héllo wörld").unwrap();
        assert_eq!(parsed.get_str("text"), Some("héllo wörld"));
    }
}
