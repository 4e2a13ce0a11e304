//! Command-line runner for skein modules.
//!
//! Thin wrapper over the host embedding API: read a JSON module document
//! (a stand-in for the real loader, which lives outside the runtime core),
//! create a worker service, submit the entry point and drive the container
//! until the result arrives.

use std::{fs, path::PathBuf, process::ExitCode, str::FromStr};

use clap::{Parser, ValueEnum};
use skein::{
    AssertSeverity, Constant, ExecOptions, ImageBuilder, MethodBody, ModuleImage, NoopTracer, Op, RecordingTracer,
    Reentrancy, RetSlot, Runtime, StderrTracer, VmTracer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TraceMode {
    Off,
    Text,
    Json,
}

/// Execute a skein module.
#[derive(Parser)]
#[command(name = "skein", version, about)]
struct Cli {
    /// Path to the module document.
    module: PathBuf,

    /// Arguments passed to the entry point (integers where they parse,
    /// strings otherwise).
    argv: Vec<String>,

    /// Entry point to invoke.
    #[arg(long, default_value = "main")]
    entry: String,

    /// Re-entrancy mode of the worker service.
    #[arg(long, default_value = "Prioritized")]
    reentrancy: String,

    /// Diagnostic tracing.
    #[arg(long, value_enum, default_value_t = TraceMode::Off)]
    trace: TraceMode,

    /// Op budget per scheduling slice.
    #[arg(long, default_value_t = 10)]
    ops_per_tick: u32,

    /// Assert failure behavior.
    #[arg(long, default_value = "Raise")]
    assert_severity: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let reentrancy = match Reentrancy::from_str(&cli.reentrancy) {
        Ok(mode) => mode,
        Err(_) => {
            eprintln!("error: unknown re-entrancy mode `{}`", cli.reentrancy);
            return ExitCode::FAILURE;
        }
    };
    let assert = match AssertSeverity::from_str(&cli.assert_severity) {
        Ok(severity) => severity,
        Err(_) => {
            eprintln!("error: unknown assert severity `{}`", cli.assert_severity);
            return ExitCode::FAILURE;
        }
    };

    let source = match fs::read_to_string(&cli.module) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read {}: {err}", cli.module.display());
            return ExitCode::FAILURE;
        }
    };
    let image = match load_module(&source) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let options = ExecOptions {
        ops_per_tick: cli.ops_per_tick,
        assert,
    };
    let runtime = match Runtime::builder(image).options(options).build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let worker = match runtime.create_service("worker", reentrancy) {
        Ok(worker) => worker,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let args = cli
        .argv
        .iter()
        .map(|raw| match raw.parse::<i64>() {
            Ok(value) => runtime.int(value),
            Err(_) => runtime.string(raw),
        })
        .collect();
    let future = match runtime.submit(&worker, &cli.entry, args) {
        Ok(future) => future,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let code = match cli.trace {
        TraceMode::Off => drive(&runtime, &future, &mut NoopTracer),
        TraceMode::Text => drive(&runtime, &future, &mut StderrTracer),
        TraceMode::Json => {
            let mut tracer = RecordingTracer::new();
            let code = drive(&runtime, &future, &mut tracer);
            match serde_json::to_string_pretty(tracer.events()) {
                Ok(json) => eprintln!("{json}"),
                Err(err) => eprintln!("error: trace serialization failed: {err}"),
            }
            code
        }
    };
    runtime.shutdown(&mut NoopTracer);
    code
}

fn drive(runtime: &Runtime, future: &skein::HostFuture, tracer: &mut dyn VmTracer) -> ExitCode {
    runtime.run_until_idle(tracer);
    match future.try_get() {
        Some(Ok(value)) => {
            println!("{value:?}");
            ExitCode::SUCCESS
        }
        Some(Err(exc)) => {
            eprintln!("exception: {exc}");
            ExitCode::FAILURE
        }
        None => {
            eprintln!("error: entry point never completed");
            ExitCode::FAILURE
        }
    }
}

/// Reads the JSON module document. This is a stand-in for the external
/// loader; unknown op names fail here, at load time, never at run time.
fn load_module(source: &str) -> Result<ModuleImage, String> {
    let doc: serde_json::Value = serde_json::from_str(source).map_err(|err| format!("malformed module: {err}"))?;
    let name = doc.get("name").and_then(|v| v.as_str()).unwrap_or("module");
    let mut builder = ImageBuilder::new(name);

    if let Some(constants) = doc.get("constants").and_then(|v| v.as_array()) {
        for constant in constants {
            builder = builder.constant(parse_constant(constant)?);
        }
    }

    let entries = doc
        .get("entries")
        .and_then(|v| v.as_object())
        .ok_or("module has no entries")?;
    for (entry_name, body) in entries {
        let max_vars = body.get("max_vars").and_then(|v| v.as_u64()).unwrap_or(8) as usize;
        let params = body.get("params").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let returns = body.get("returns").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let raw_ops = body
            .get("ops")
            .and_then(|v| v.as_array())
            .ok_or_else(|| format!("entry `{entry_name}` has no ops"))?;
        let mut ops = Vec::with_capacity(raw_ops.len());
        for (offset, raw) in raw_ops.iter().enumerate() {
            ops.push(parse_op(raw).map_err(|err| format!("`{entry_name}` op {offset}: {err}"))?);
        }
        builder = builder.entry(
            entry_name.clone(),
            std::sync::Arc::new(MethodBody::new(entry_name.clone(), ops, max_vars, params, returns)),
        );
    }

    builder.build().map_err(|err| err.to_string())
}

fn parse_constant(raw: &serde_json::Value) -> Result<Constant, String> {
    if let Some(i) = raw.get("int").and_then(|v| v.as_i64()) {
        return Ok(Constant::Int(i));
    }
    if let Some(f) = raw.get("float").and_then(|v| v.as_f64()) {
        return Ok(Constant::Float(f));
    }
    if let Some(b) = raw.get("bool").and_then(|v| v.as_bool()) {
        return Ok(Constant::Bool(b));
    }
    if let Some(s) = raw.get("str").and_then(|v| v.as_str()) {
        return Ok(Constant::Str(s.into()));
    }
    Err(format!("unsupported constant: {raw}"))
}

fn parse_op(raw: &serde_json::Value) -> Result<Op, String> {
    let parts = raw.as_array().ok_or("op must be an array")?;
    let tag = parts
        .first()
        .and_then(|v| v.as_str())
        .ok_or("op must start with a name")?;
    let operand = |i: usize| -> Result<u64, String> {
        parts
            .get(i)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| format!("`{tag}` needs operand {i}"))
    };
    match tag {
        "nop" => Ok(Op::Nop),
        "load" => Ok(Op::LoadConst {
            pool: operand(1)? as u32,
            dst: RetSlot::Slot(operand(2)? as u16),
        }),
        "move" => Ok(Op::Move {
            src: operand(1)? as u16,
            dst: RetSlot::Slot(operand(2)? as u16),
        }),
        "jump" => Ok(Op::Jump(operand(1)? as usize)),
        "jt" => Ok(Op::JumpIfTrue {
            cond: operand(1)? as u16,
            target: operand(2)? as usize,
        }),
        "jf" => Ok(Op::JumpIfFalse {
            cond: operand(1)? as u16,
            target: operand(2)? as usize,
        }),
        "assert" => Ok(Op::Assert {
            cond: operand(1)? as u16,
        }),
        "yield" => Ok(Op::Yield),
        "ret" => Ok(Op::Return0),
        "ret1" => Ok(Op::Return1 {
            src: operand(1)? as u16,
        }),
        other => Err(format!("unknown opcode `{other}`")),
    }
}
