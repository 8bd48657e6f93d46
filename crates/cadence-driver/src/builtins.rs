use std::collections::BTreeMap;
use std::fmt::Write;

use cadence_scheduler::{CommandOutput, CommandRegistry};

/// Registry with the internal commands shipped in the binary.
pub fn registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register("echo", echo);
    registry
}

/// Positional args joined by spaces, then keyword args as `k=v`.
fn echo(
    args: &[String],
    kwargs: &BTreeMap<String, String>,
    out: &mut CommandOutput,
) -> anyhow::Result<()> {
    let words: Vec<String> = args
        .iter()
        .cloned()
        .chain(kwargs.iter().map(|(k, v)| format!("{k}={v}")))
        .collect();
    writeln!(out.stdout, "{}", words.join(" "))?;
    Ok(())
}
