//! Developer runner: execute one worker event against a module file
//! with an in-memory environment, and print what happened.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hornet_bindings::memory::{MemoryBucket, MemoryCache, MemoryKv, MemoryQueue};
use hornet_bindings::{Environment, HostRequest};
use hornet_engine::{Engine, EngineConfig, ExecutionResult};

#[derive(Parser)]
#[command(name = "hornet", version, about = "Run worker modules against synthetic events")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Execution timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 30_000)]
    timeout_ms: u64,

    /// Per-VM memory limit in megabytes.
    #[arg(long, global = true, default_value_t = 128)]
    memory_mb: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Dispatch one HTTP request to the module's fetch handler.
    Run {
        /// Path to the worker module.
        script: PathBuf,

        /// Request URL.
        #[arg(long, default_value = "http://localhost/")]
        url: String,

        /// Request method.
        #[arg(long, default_value = "GET")]
        method: String,

        /// Request header, `name:value`. Repeatable.
        #[arg(long = "header", value_name = "NAME:VALUE")]
        headers: Vec<String>,

        /// Request body.
        #[arg(long)]
        body: Option<String>,

        /// Environment variable, `NAME=VALUE`. Repeatable.
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Secret, `NAME=VALUE`. Repeatable.
        #[arg(long = "secret", value_name = "NAME=VALUE")]
        secrets: Vec<String>,

        /// Attach an empty in-memory KV store under this binding name.
        /// Repeatable.
        #[arg(long = "kv", value_name = "NAME")]
        kv: Vec<String>,
    },

    /// Fire the module's scheduled handler once.
    Cron {
        /// Path to the worker module.
        script: PathBuf,

        /// Cron expression passed through in the event.
        #[arg(long, default_value = "* * * * *")]
        cron: String,
    },

    /// Call a named export with JSON arguments.
    Call {
        /// Path to the worker module.
        script: PathBuf,

        /// Exported function name.
        function: String,

        /// JSON-encoded arguments.
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::default()
        .pool_size(1)
        .execution_timeout_ms(cli.timeout_ms)
        .memory_limit_mb(cli.memory_mb);
    let engine = Engine::new(config)?;

    let result = match cli.command {
        Command::Run {
            script,
            url,
            method,
            headers,
            body,
            vars,
            secrets,
            kv,
        } => {
            compile(&engine, &script)?;
            let mut request = HostRequest::get(url).with_method(method.to_uppercase());
            for header in &headers {
                let (name, value) = header
                    .split_once(':')
                    .with_context(|| format!("header '{header}' is not NAME:VALUE"))?;
                request.insert_header(name.trim(), value.trim().to_string());
            }
            if let Some(body) = body {
                request.body = body.into_bytes();
            }
            let env = build_env(&vars, &secrets, &kv)?;
            engine.execute("cli", "dev", env, request)
        }
        Command::Cron { script, cron } => {
            compile(&engine, &script)?;
            engine.execute_scheduled("cli", "dev", Environment::new(), &cron)
        }
        Command::Call {
            script,
            function,
            args,
        } => {
            compile(&engine, &script)?;
            let parsed = args
                .iter()
                .map(|raw| {
                    serde_json::from_str(raw)
                        .with_context(|| format!("argument '{raw}' is not valid JSON"))
                })
                .collect::<Result<Vec<_>>>()?;
            engine.execute_function("cli", "dev", Environment::new(), &function, parsed)
        }
    };

    report(&result);
    engine.shutdown();
    if result.error.is_some() {
        std::process::exit(1);
    }
    Ok(())
}

fn compile(engine: &Arc<Engine>, script: &PathBuf) -> Result<()> {
    let source = std::fs::read_to_string(script)
        .with_context(|| format!("failed to read {}", script.display()))?;
    engine
        .compile_and_cache("cli", "dev", &source)
        .with_context(|| format!("failed to compile {}", script.display()))?;
    Ok(())
}

fn build_env(vars: &[String], secrets: &[String], kv: &[String]) -> Result<Environment> {
    let mut env = Environment::new()
        .with_bucket("FILES", Arc::new(MemoryBucket::new()))
        .with_queue("JOBS", Arc::new(MemoryQueue::new()))
        .with_cache(Arc::new(MemoryCache::new()));
    for pair in vars {
        let (name, value) = split_pair(pair)?;
        env = env.with_var(name, value);
    }
    for pair in secrets {
        let (name, value) = split_pair(pair)?;
        env = env.with_secret(name, value);
    }
    for name in kv {
        env = env.with_kv(name.clone(), Arc::new(MemoryKv::new()));
    }
    Ok(env)
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    match pair.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => bail!("'{pair}' is not NAME=VALUE"),
    }
}

fn report(result: &ExecutionResult) {
    for entry in &result.logs {
        eprintln!("[{}] {}", entry.level.as_str(), entry.message);
    }
    if let Some(error) = &result.error {
        eprintln!("error: {error} ({}ms)", result.duration.as_millis());
        return;
    }
    if let Some(response) = &result.response {
        eprintln!(
            "{} {} ({}ms)",
            response.status,
            response.status_text,
            result.duration.as_millis()
        );
        let mut names: Vec<_> = response.headers.keys().collect();
        names.sort();
        for name in names {
            eprintln!("{name}: {}", response.headers[name]);
        }
        println!("{}", response.body_text());
    } else if let Some(data) = &result.data {
        println!("{data}");
    } else {
        eprintln!("done ({}ms)", result.duration.as_millis());
    }
    if result.websocket.is_some() {
        eprintln!("(response carried a WebSocket upgrade; sessions are not bridged by the CLI)");
    }
}
