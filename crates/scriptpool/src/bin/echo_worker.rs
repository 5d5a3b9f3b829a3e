//! Reference worker used by the integration tests and the CLI.
//!
//! Usage: `scriptpool-echo-worker <entry-script>`, launched by a supervisor
//! with the channel on descriptors 3 and 4. The entry script must exist in
//! the working directory. Its contents select special startup behavior:
//! `fail-startup` exits before the handshake and `hang-startup` never
//! sends it.

use scriptpool::{Float64Array, WorkerRuntime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Deserialize)]
struct AddArgs {
    a: Number,
    b: Number,
}

#[derive(Deserialize)]
struct AddArraysArgs {
    a: Float64Array,
    b: Float64Array,
}

#[derive(Deserialize)]
struct SleepArgs {
    ms: u64,
}

#[derive(Deserialize)]
struct WindowArgs {
    id: u64,
    ms: u64,
}

#[derive(Serialize)]
struct Window {
    id: u64,
    pid: u32,
    start_us: u128,
    end_us: u128,
}

#[derive(Deserialize)]
struct ExitArgs {
    code: i32,
}

#[derive(Deserialize)]
struct ReadFileArgs {
    path: PathBuf,
}

fn add_numbers(a: &Number, b: &Number) -> Result<Value, String> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| "integer overflow".to_string());
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err("operands are not numbers".to_string()),
    }
}

fn now_us() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros())
        .unwrap_or(0)
}

fn runtime(script: PathBuf, source: String) -> WorkerRuntime {
    let mut runtime = WorkerRuntime::new();
    runtime
        .register("add", |args: AddArgs| -> Result<Value, String> {
            Ok(json!({ "result": add_numbers(&args.a, &args.b)? }))
        })
        .register("add_scalar_output", |args: AddArgs| -> Result<Value, String> {
            add_numbers(&args.a, &args.b)
        })
        .register("add_arrays", |args: AddArraysArgs| -> Result<Float64Array, String> {
            if args.a.len() != args.b.len() {
                return Err(format!(
                    "length mismatch: {} vs {}",
                    args.a.len(),
                    args.b.len()
                ));
            }
            let sum: Vec<f64> = args.a.iter().zip(args.b.iter()).map(|(a, b)| a + b).collect();
            Ok(Float64Array::from(sum))
        })
        .register("identity", |value: Value| -> Result<Value, String> { Ok(value) })
        .register("pid", |_: Value| -> Result<u32, String> { Ok(std::process::id()) })
        .register("sleep", |args: SleepArgs| -> Result<Value, String> {
            std::thread::sleep(Duration::from_millis(args.ms));
            Ok(json!({ "slept_ms": args.ms }))
        })
        .register("window", |args: WindowArgs| -> Result<Window, String> {
            let start_us = now_us();
            std::thread::sleep(Duration::from_millis(args.ms));
            Ok(Window {
                id: args.id,
                pid: std::process::id(),
                start_us,
                end_us: now_us(),
            })
        })
        .register("exit", |args: ExitArgs| -> Result<Value, String> {
            std::process::exit(args.code)
        })
        .register("fail", |message: Option<String>| -> Result<Value, String> {
            Err(message.unwrap_or_else(|| "deliberate failure".to_string()))
        })
        .register("read_file", |args: ReadFileArgs| -> Result<String, String> {
            std::fs::read_to_string(&args.path)
                .map_err(|e| format!("reading {}: {}", args.path.display(), e))
        })
        .register("script_source", move |_: Value| -> Result<Value, String> {
            Ok(json!({ "script": script.display().to_string(), "source": source }))
        });
    runtime
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let Some(script) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: scriptpool-echo-worker <entry-script>");
        std::process::exit(2);
    };
    let source = match std::fs::read_to_string(&script) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot read entry script {}: {}", script.display(), e);
            std::process::exit(2);
        }
    };

    match source.trim() {
        "fail-startup" => {
            eprintln!("entry script requested a startup failure");
            std::process::exit(3);
        }
        "hang-startup" => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },
        _ => {}
    }

    println!(
        "echo worker {} serving {}",
        std::process::id(),
        script.display()
    );

    if let Err(e) = runtime(script, source).serve_inherited().await {
        eprintln!("channel error: {}", e);
        std::process::exit(1);
    }
}
