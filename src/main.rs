//! Bindhost CLI - tools for bindgen-style guest modules
//!
//! Commands:
//!   bindhost inspect <wasm>      - Display imports, exports and schema status
//!   bindhost run <path-or-url>   - Instantiate and call the turtle exports

use anyhow::Context;
use bindhost::logging::{init_tracing, LogFormat};
use bindhost::runtime::exports::describe;
use bindhost::runtime::BindingSchema;
use bindhost::{Bindings, HostValue, InitInput, Runtime, RuntimeConfig, Scalar};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use wasmtime::{Engine, ExternType, Module};

#[derive(Parser)]
#[command(name = "bindhost")]
#[command(about = "Host for wasm-bindgen style guest modules", long_about = None)]
struct Cli {
    /// Log filter directive (overrides BINDHOST_LOG)
    #[arg(long, global = true)]
    log: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect a module without instantiating it
    Inspect {
        /// Path to the WASM file
        wasm_file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Instantiate a module and call its exports
    Run {
        /// Path or URL (file:, http:, https:) of the module
        source: String,

        /// Resolve the module asynchronously
        #[arg(long = "async")]
        use_async: bool,

        /// Runtime config JSON file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref(), cli.log_format)?;

    match cli.command {
        Commands::Inspect { wasm_file, json } => inspect_command(&wasm_file, json),
        Commands::Run {
            source,
            use_async,
            config,
        } => run_command(&source, use_async, config.as_deref()).await,
    }
}

#[derive(Serialize)]
struct InspectReport {
    imports: Vec<Item>,
    exports: Vec<Item>,
    custom_sections: Vec<String>,
    schema_error: Option<String>,
}

#[derive(Serialize)]
struct Item {
    module: Option<String>,
    name: String,
    ty: String,
}

fn describe_extern(ty: &ExternType) -> String {
    match ty {
        ExternType::Func(func) => describe(func),
        ExternType::Memory(memory) => format!("memory[{}]", memory.minimum()),
        ExternType::Global(_) => "global".to_string(),
        ExternType::Table(_) => "table".to_string(),
        #[allow(unreachable_patterns)]
        _ => "other".to_string(),
    }
}

fn custom_sections(bytes: &[u8]) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for payload in wasmparser::Parser::new(0).parse_all(bytes) {
        if let wasmparser::Payload::CustomSection(reader) = payload.context("Failed to parse WASM")? {
            names.push(reader.name().to_string());
        }
    }
    Ok(names)
}

fn inspect_command(wasm_file: &Path, json: bool) -> anyhow::Result<()> {
    let wasm_bytes = std::fs::read(wasm_file)
        .with_context(|| format!("Failed to read {}", wasm_file.display()))?;

    let module = Module::new(&Engine::default(), &wasm_bytes)
        .map_err(|e| anyhow::anyhow!("Failed to compile WASM: {e:#}"))?;

    let report = InspectReport {
        imports: module
            .imports()
            .map(|import| Item {
                module: Some(import.module().to_string()),
                name: import.name().to_string(),
                ty: describe_extern(&import.ty()),
            })
            .collect(),
        exports: module
            .exports()
            .map(|export| Item {
                module: None,
                name: export.name().to_string(),
                ty: describe_extern(&export.ty()),
            })
            .collect(),
        custom_sections: custom_sections(&wasm_bytes)?,
        schema_error: BindingSchema::turtle()
            .validate_module(&module)
            .err()
            .map(|e| e.to_string()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if !report.imports.is_empty() {
        println!("imports:");
        for item in &report.imports {
            println!("  {}.{}: {}", item.module.as_deref().unwrap_or(""), item.name, item.ty);
        }
    }
    if !report.exports.is_empty() {
        println!("exports:");
        for item in &report.exports {
            println!("  {}: {}", item.name, item.ty);
        }
    }
    if !report.custom_sections.is_empty() {
        println!("custom sections: {}", report.custom_sections.join(", "));
    }
    match &report.schema_error {
        None => println!("schema: ok"),
        Some(error) => println!("schema: {error}"),
    }
    Ok(())
}

#[derive(Serialize)]
struct RunReport {
    test1: Scalar,
    test2: Scalar,
    boxed_slice: Vec<HostValue>,
}

fn source_input(source: &str) -> InitInput {
    match reqwest::Url::parse(source) {
        Ok(url) if matches!(url.scheme(), "file" | "http" | "https") => InitInput::Url(url),
        _ => InitInput::Path(PathBuf::from(source)),
    }
}

async fn run_command(source: &str, use_async: bool, config: Option<&Path>) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => RuntimeConfig::from_path(path)?,
        None => RuntimeConfig::default(),
    };
    let runtime = Runtime::with_config(config)?;

    let mut bindings: Bindings = if use_async {
        runtime.init(source_input(source)).await?
    } else {
        let bytes = std::fs::read(source).with_context(|| format!("Failed to read {source}"))?;
        runtime.init_sync(bytes)?
    };

    let report = RunReport {
        test1: bindings.test1()?,
        test2: bindings.test2()?,
        boxed_slice: bindings.return_boxed_js_value_slice()?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
