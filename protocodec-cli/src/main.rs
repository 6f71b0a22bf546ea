// main.rs
use anyhow::{Context, Result};
use argh::FromArgs;
use indexmap::IndexMap;
use protocodec::{Instance, Protocol, Value};
use std::path::PathBuf;

#[derive(FromArgs, PartialEq, Debug)]
/// Encode or decode a message against a protocodec schema
struct Cli {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum Command {
    Encode(Encode),
    Decode(Decode),
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "encode")]
/// reads a schema and a YAML/JSON value map, prints the packed bytes as hex
struct Encode {
    /// path to the schema YAML file
    #[argh(positional)]
    schema_path: PathBuf,

    /// path to a YAML or JSON file of node id -> value
    #[argh(positional)]
    values_path: PathBuf,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "decode")]
/// reads a schema and a hex-encoded byte string, prints the decoded instance as YAML
struct Decode {
    /// path to the schema YAML file
    #[argh(positional)]
    schema_path: PathBuf,

    /// hex string of the bytes to decode (no 0x prefix, whitespace ignored)
    #[argh(positional)]
    hex_bytes: String,
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();
    match cli.command {
        Command::Encode(cmd) => encode(cmd),
        Command::Decode(cmd) => decode(cmd),
    }
}

fn encode(cmd: Encode) -> Result<()> {
    let schema = load_schema(&cmd.schema_path)?;
    let values = load_values(&cmd.values_path)?;

    let mut instance = Instance::new(schema);
    for (path, value) in values {
        instance.set(path, value);
    }

    let bytes = instance
        .encode()
        .context("failed to encode instance against schema")?;
    println!("{}", hex_of(&bytes));
    Ok(())
}

fn decode(cmd: Decode) -> Result<()> {
    let schema = load_schema(&cmd.schema_path)?;
    let bytes = parse_hex(&cmd.hex_bytes).context("failed to parse hex byte string")?;

    let instance =
        Instance::decode(&schema, &bytes).context("failed to decode bytes against schema")?;

    let yaml = serde_yaml::to_string(&instance.values)
        .context("failed to render decoded instance as YAML")?;
    print!("{yaml}");
    Ok(())
}

fn load_schema(path: &PathBuf) -> Result<Protocol> {
    Protocol::load_from_file(path)
        .with_context(|| format!("failed to load schema from {}", path.display()))
}

fn load_values(path: &PathBuf) -> Result<IndexMap<String, Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read values file {}", path.display()))?;
    let values: IndexMap<String, Value> = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {} as JSON", path.display()))?
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse {} as YAML", path.display()))?
    };
    Ok(values)
}

fn hex_of(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        anyhow::bail!("hex string must have an even number of digits");
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).context("invalid hex digit"))
        .collect()
}
