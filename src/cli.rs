use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::types::{Inputs, Value};

/// wpsr - script-backed algorithm registry and runtime
#[derive(Parser, Debug)]
#[command(name = "wpsr")]
#[command(about = "Expose annotated R scripts as invocable algorithms")]
#[command(version)]
pub struct Cli {
    /// Configuration file (created on first reconciliation)
    #[arg(short, long, global = true, default_value = "wpsr.json")]
    pub config: PathBuf,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sync the configuration with the script directories and report changes
    Reconcile,
    /// List registered algorithms
    List,
    /// Print the process description of an algorithm as JSON
    Describe {
        /// Public algorithm identifier
        id: String,
    },
    /// Invoke an algorithm and print its outputs as JSON
    Run {
        /// Public algorithm identifier
        id: String,
        /// Input binding, repeatable (values are JSON, otherwise text)
        #[arg(short, long = "input", value_name = "NAME=VALUE", value_parser = parse_binding)]
        inputs: Vec<(String, Value)>,
    },
    /// Parse one script file and report every description problem
    Validate {
        /// Script file to check
        script: PathBuf,
    },
    /// Reconcile whenever the configuration file changes, until interrupted
    Watch,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

/// Parse `name=value`; the value is a JSON literal or plain text
pub fn parse_binding(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing input name in '{}'", raw));
    }
    Ok((name.to_string(), Value::parse_literal(value)))
}

/// Collect bindings; a repeated name accumulates into a list
pub fn collect_inputs(bindings: Vec<(String, Value)>) -> Inputs {
    let mut inputs = Inputs::new();
    for (name, value) in bindings {
        match inputs.remove(&name) {
            None => {
                inputs.insert(name, value);
            }
            Some(Value::List(mut items)) => {
                items.push(value);
                inputs.insert(name, Value::List(items));
            }
            Some(previous) => {
                inputs.insert(name, Value::List(vec![previous, value]));
            }
        }
    }
    inputs
}
