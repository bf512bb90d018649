use anyhow::Result;
use serde::Serialize;

/// Prints an object to stdout as pretty JSON. Used by CLI listing
/// subcommands and `--print-config`.
pub fn pretty_json<T: Serialize>(o: T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&o)?);
    Ok(())
}
