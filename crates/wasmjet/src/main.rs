use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use wasmjet::{
    Compartment, Engine, EngineConfig, Func, InvokeError, IntrinsicResolver, Module, OptLevel,
    StubResolver, ValType, Value,
};

/// Run WebAssembly modules compiled to native code.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input module, binary (.wasm) or text (.wat)
    input: PathBuf,

    /// Export to call (default: `_start`, then `main`)
    #[arg(long)]
    invoke: Option<String>,

    /// Arguments, parsed according to the export's parameter types
    #[arg(allow_negative_numbers = true)]
    args: Vec<String>,

    /// Keep inline bounds checks instead of relying on guard pages
    #[arg(long)]
    no_guard_pages: bool,

    /// Maximum pages for memories declared without a maximum
    #[arg(long)]
    max_memory_pages: Option<u32>,

    /// Maximum elements for tables declared without a maximum
    #[arg(long)]
    max_table_elements: Option<u32>,

    /// Code generator optimization level (none, speed, speed_and_size)
    #[arg(long, default_value_t = OptLevel::Speed)]
    opt_level: OptLevel,

    /// Replace unresolved imports with trapping stubs and fresh objects
    #[arg(long)]
    stub_imports: bool,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            guard_page_elision: defaults.guard_page_elision && !self.no_guard_pages,
            default_max_memory_pages: self
                .max_memory_pages
                .unwrap_or(defaults.default_max_memory_pages),
            default_max_table_elements: self
                .max_table_elements
                .unwrap_or(defaults.default_max_table_elements),
            opt_level: self.opt_level,
        }
    }
}

fn parse_arg(ty: ValType, text: &str) -> Result<Value> {
    Ok(match ty {
        ValType::I32 => Value::I32(
            text.parse::<i32>()
                .or_else(|_| text.parse::<u32>().map(|v| v as i32))?,
        ),
        ValType::I64 => Value::I64(
            text.parse::<i64>()
                .or_else(|_| text.parse::<u64>().map(|v| v as i64))?,
        ),
        ValType::F32 => Value::F32(text.parse()?),
        ValType::F64 => Value::F64(text.parse()?),
    })
}

fn format_value(value: &Value) -> String {
    match value {
        Value::I32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::F32(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
    }
}

fn entry_point(cli: &Cli, instance: &wasmjet::Instance) -> Result<(String, Func)> {
    if let Some(name) = &cli.invoke {
        let func = instance
            .func(name)
            .ok_or_else(|| anyhow!("module has no exported function '{name}'"))?;
        return Ok((name.clone(), func));
    }
    for name in ["_start", "main"] {
        if let Some(func) = instance.func(name) {
            return Ok((name.to_string(), func));
        }
    }
    bail!("module exports neither '_start' nor 'main'; pick a function with --invoke")
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let module = Module::from_file(&cli.input)
        .with_context(|| format!("failed to load {}", cli.input.display()))?;
    let engine = Engine::new(cli.engine_config())?;
    let compartment = Compartment::new(&engine);

    let name = cli
        .input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("module");
    let instance = if cli.stub_imports {
        compartment.instantiate_named(&module, name, &StubResolver::new(IntrinsicResolver))
    } else {
        compartment.instantiate_named(&module, name, &IntrinsicResolver)
    };
    let instance = match instance {
        Ok(instance) => instance,
        Err(wasmjet::InstantiationError::Start(trap)) => {
            eprintln!("wasmjet: start function trapped: {trap}");
            eprint!("{}", trap.call_stack);
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => return Err(err).context("instantiation failed"),
    };

    let (export, func) = entry_point(cli, &instance)?;
    let params = func.ty().params();
    if cli.args.len() != params.len() {
        bail!(
            "'{export}' takes {} argument(s), {} given",
            params.len(),
            cli.args.len()
        );
    }
    let args = params
        .iter()
        .zip(&cli.args)
        .enumerate()
        .map(|(i, (&ty, text))| {
            parse_arg(ty, text).with_context(|| format!("argument {i}: '{text}' is not a valid {ty}"))
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(export = %export, "invoking");
    match func.call(&args) {
        Ok(results) => {
            for value in &results {
                println!("{}", format_value(value));
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(InvokeError::Trap(trap)) => {
            eprintln!("wasmjet: trap in '{export}': {trap}");
            eprint!("{}", trap.call_stack);
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("wasmjet: {err:#}");
            ExitCode::FAILURE
        }
    }
}
