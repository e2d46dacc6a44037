/*
 * Copyright (c) 2025 Mongora Project. All rights reserved.
 *
 * Mongora - MongoDB aggregation pipeline to Oracle SQL/JSON translator
 *
 * @file main.rs
 * @brief CLI front end: pipeline JSON in, Oracle SQL out
 */

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use bson::{Bson, Document};
use clap::Parser;

use mongora::{
    init_tracing_logger, FileConfig, LogLevel, OracleDialect, Translator, TranslatorConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "mongora",
    version,
    about = "Translate a MongoDB aggregation pipeline to one Oracle SQL/JSON statement"
)]
struct Cli {
    /// Pipeline JSON file (a JSON array of stage documents); stdin when
    /// omitted
    input: Option<PathBuf>,

    /// Target collection table name
    #[arg(short, long)]
    collection: Option<String>,

    /// JSON document column of the collection table
    #[arg(long)]
    data_column: Option<String>,

    /// Schema qualifier for table names
    #[arg(long)]
    schema: Option<String>,

    /// SQL dialect: base or extended
    #[arg(long)]
    dialect: Option<String>,

    /// One clause per line
    #[arg(long)]
    pretty: bool,

    /// Inline literals instead of bind placeholders
    #[arg(long)]
    inline_binds: bool,

    /// Fail on unsupported operators instead of emitting placeholders
    #[arg(long)]
    strict: bool,

    /// Optimiser hint text for the outermost SELECT
    #[arg(long)]
    hint: Option<String>,

    /// TOML configuration file ([translator] and [options] tables)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warning
    };
    if init_tracing_logger(level).is_err() {
        eprintln!("mongora: logging initialisation failed");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Usage(message)) => {
            eprintln!("mongora: {}", message);
            ExitCode::from(2)
        }
        Err(RunError::Translation(message)) => {
            eprintln!("mongora: {}", message);
            ExitCode::from(1)
        }
    }
}

enum RunError {
    Usage(String),
    Translation(String),
}

fn run(cli: Cli) -> Result<(), RunError> {
    let file_config = match &cli.config {
        Some(path) => Some(
            FileConfig::load_from_file(&path.to_string_lossy())
                .map_err(|e| RunError::Usage(e.to_string()))?,
        ),
        None => None,
    };

    let mut config = match (
        cli.collection.clone(),
        file_config.as_ref().and_then(|f| f.translator.clone()),
    ) {
        (Some(collection), Some(mut from_file)) => {
            from_file.collection = collection;
            from_file
        }
        (Some(collection), None) => TranslatorConfig::new(collection),
        (None, Some(from_file)) => from_file,
        (None, None) => {
            return Err(RunError::Usage(
                "a collection is required (--collection or a config file)".to_string(),
            ))
        }
    };
    if let Some(data_column) = cli.data_column {
        config.data_column = data_column;
    }
    if let Some(schema) = cli.schema {
        config.schema = Some(schema);
    }
    if let Some(dialect) = cli.dialect.as_deref() {
        config.dialect = match dialect {
            "base" => OracleDialect::Base,
            "extended" => OracleDialect::Extended,
            other => {
                return Err(RunError::Usage(format!(
                    "unknown dialect: {} (expected base or extended)",
                    other
                )))
            }
        };
    }

    let mut options = file_config
        .and_then(|f| f.options)
        .unwrap_or_default();
    options.pretty |= cli.pretty;
    options.inline_binds |= cli.inline_binds;
    options.strict |= cli.strict;
    if cli.hint.is_some() {
        options.oracle_hint = cli.hint;
    }

    let text = read_input(cli.input.as_deref())
        .map_err(|e| RunError::Usage(format!("cannot read pipeline input: {}", e)))?;
    let stages = parse_stage_documents(&text).map_err(RunError::Translation)?;

    let translator = Translator::new(config)
        .map_err(|e| RunError::Usage(e.to_string()))?
        .with_options(options);
    let translation = translator
        .translate(&stages)
        .map_err(|e| RunError::Translation(e.to_string()))?;

    println!("{}", translation.sql);
    for (i, bind) in translation.binds.iter().enumerate() {
        println!("-- :{} = {}", i + 1, bind);
    }
    Ok(())
}

fn read_input(path: Option<&std::path::Path>) -> std::io::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

fn parse_stage_documents(text: &str) -> Result<Vec<Document>, String> {
    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("invalid pipeline JSON: {}", e))?;
    let value = Bson::try_from(json).map_err(|e| format!("invalid pipeline value: {}", e))?;
    let Bson::Array(items) = value else {
        return Err("pipeline input must be a JSON array of stage documents".to_string());
    };
    let mut stages = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Bson::Document(doc) => stages.push(doc),
            _ => return Err("each pipeline stage must be a document".to_string()),
        }
    }
    Ok(stages)
}
