// Warehouse Pipeline - CLI
// One stage per invocation, or the chained run; prints the {"statusCode", "body"} response

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use warehouse_pipeline::{Config, LoadRequest, Pipeline, StageResponse, TransformRequest};

const USAGE: &str = "usage: warehouse-pipeline [--config <path>] <command> [args]

commands:
  extract                      land new source rows and advance watermarks
  transform <table>...         rebuild outputs affected by the given source tables
  transform --payload <json>   same, from {\"updates\": [...]}
  load [<artifact-key>...]     load processed artifacts (all when none given)
  load --payload <json>        same, from {\"Records\": [...]}
  run                          extract, then transform and load what changed";

fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();

    let config_path = take_option(&mut args, "--config")?.map(PathBuf::from);
    let config = Config::resolve(config_path.as_deref()).context("Failed to load configuration")?;
    config.logging.init();

    let Some(command) = args.first().cloned() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };
    let rest = args.split_off(1);

    let pipeline = Pipeline::open(config).context("Failed to open storage areas")?;
    let response = match command.as_str() {
        "extract" => pipeline.run_extract(),
        "transform" => pipeline.run_transform(&transform_request(rest)?),
        "load" => pipeline.run_load(&load_request(rest)?),
        "run" => pipeline.run_chain(),
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            return Ok(());
        }
        other => bail!("unknown command '{}'\n\n{}", other, USAGE),
    };

    emit(&response)
}

/// Remove `--name value` from `args`, returning the value
fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == name) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{} needs a value", name);
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn transform_request(mut args: Vec<String>) -> Result<TransformRequest> {
    match take_option(&mut args, "--payload")? {
        Some(json) => serde_json::from_str(&json).context("Invalid transform payload"),
        None => Ok(TransformRequest { updates: args }),
    }
}

fn load_request(mut args: Vec<String>) -> Result<LoadRequest> {
    match take_option(&mut args, "--payload")? {
        Some(json) => serde_json::from_str(&json).context("Invalid load payload"),
        None if args.is_empty() => Ok(LoadRequest::default()),
        None => Ok(LoadRequest::for_keys(args)),
    }
}

fn emit(response: &StageResponse) -> Result<()> {
    println!("{}", serde_json::to_string(response)?);
    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
