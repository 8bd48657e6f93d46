//! What a job executes, and how its raw `args` string is interpreted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// A fully resolved invocation, built once per run from a job's fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandSpec {
    /// An in-process command looked up in the executor's registry.
    Internal {
        name: String,
        args: Vec<String>,
        kwargs: BTreeMap<String, String>,
    },

    /// A command line handed to a shell interpreter (`<shell> -c <script>`).
    ///
    /// The script has backtick, dollar sign and double quote backslash-escaped
    /// (see [`escape_shell_command`]). That blocks the most obvious command and
    /// variable substitution but it is NOT a sanitizer: pipes, redirections,
    /// `;` and single quotes pass through untouched. Whoever writes a job in
    /// this mode is trusted with a shell.
    Shell { script: String },

    /// A program executed directly with a tokenized argument vector. No shell
    /// is involved.
    Process { program: String, args: Vec<String> },
}

impl CommandSpec {
    /// Resolve a job's command fields.
    ///
    /// Exactly one of `command` and `shell_command` must be non-blank.
    pub fn build(
        command: &str,
        shell_command: &str,
        run_in_shell: bool,
        args: &str,
    ) -> Result<Self> {
        let command = command.trim();
        let shell_command = shell_command.trim();

        match (command.is_empty(), shell_command.is_empty()) {
            (true, true) => Err(SchedulerError::InvalidCommand(
                "neither command nor shell_command is set".to_string(),
            )),
            (false, false) => Err(SchedulerError::InvalidCommand(
                "both command and shell_command are set".to_string(),
            )),
            (false, true) => {
                let (args, kwargs) = parse_args(args);
                Ok(CommandSpec::Internal {
                    name: command.to_string(),
                    args,
                    kwargs,
                })
            }
            (true, false) => {
                let line = format!("{shell_command} {args}");
                if run_in_shell {
                    return Ok(CommandSpec::Shell {
                        script: escape_shell_command(&line),
                    });
                }
                let mut words = split_words(&line)?.into_iter();
                let program = words.next().ok_or_else(|| {
                    SchedulerError::InvalidCommand("shell_command has no words".to_string())
                })?;
                Ok(CommandSpec::Process {
                    program,
                    args: words.collect(),
                })
            }
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, CommandSpec::Internal { .. })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpec::Internal { name, args, kwargs } => {
                write!(f, "{name}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                for (key, value) in kwargs {
                    write!(f, " {key}={value}")?;
                }
                Ok(())
            }
            CommandSpec::Shell { script } => write!(f, "sh -c {script}"),
            CommandSpec::Process { program, args } => {
                write!(f, "{program}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
        }
    }
}

/// Split an args string into positional and keyword arguments.
///
/// Tokens are separated by whitespace; a token containing `=` is split on
/// its first `=` into a keyword pair, any other token is positional.
pub fn parse_args(raw: &str) -> (Vec<String>, BTreeMap<String, String>) {
    let mut args = Vec::new();
    let mut kwargs = BTreeMap::new();
    for token in raw.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => {
                kwargs.insert(key.to_string(), value.to_string());
            }
            None => args.push(token.to_string()),
        }
    }
    (args, kwargs)
}

/// Backslash-escape `` ` ``, `$` and `"`.
pub fn escape_shell_command(command: &str) -> String {
    let mut escaped = String::with_capacity(command.len());
    for c in command.chars() {
        if matches!(c, '`' | '$' | '"') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Split a command line into words using POSIX shell quoting rules.
///
/// Single quotes are literal. Inside double quotes a backslash only escapes
/// `\` and `"`; outside quotes it escapes any character. No expansion of any
/// kind is performed.
pub fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Quote::None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            (Quote::None, '\'') => {
                quote = Quote::Single;
                in_word = true;
            }
            (Quote::None, '"') => {
                quote = Quote::Double;
                in_word = true;
            }
            (Quote::None, '\\') => {
                let escaped = chars.next().ok_or_else(|| {
                    SchedulerError::InvalidCommand(
                        "no character after trailing backslash".to_string(),
                    )
                })?;
                word.push(escaped);
                in_word = true;
            }
            (Quote::None, c) => {
                word.push(c);
                in_word = true;
            }
            (Quote::Single, '\'') | (Quote::Double, '"') => quote = Quote::None,
            (Quote::Double, '\\') => match chars.next() {
                Some(next @ ('\\' | '"')) => word.push(next),
                Some(next) => {
                    word.push('\\');
                    word.push(next);
                }
                None => {
                    return Err(SchedulerError::InvalidCommand(
                        "no closing quotation".to_string(),
                    ))
                }
            },
            (_, c) => word.push(c),
        }
    }

    if quote != Quote::None {
        return Err(SchedulerError::InvalidCommand("no closing quotation".to_string()));
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}
