//! Scripthost CLI

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use scripthost_core::config::{load_from_file, validate};
use scripthost_core::{EngineConfig, ScriptHostConfig, ScriptLanguage, ScriptSource, Value};
use scripthost_debug::{Breakpoint, DebugEventKind, DebugTarget};
use scripthost_engine::{ReplEngine, ScriptEngine};
use std::future::IntoFuture;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "scripthost")]
#[command(about = "Run, debug and explore embedded scripts", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct LogArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Args)]
struct EngineArgs {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additional module search root (repeatable)
    #[arg(short = 'I', long = "module-root", value_name = "DIR")]
    module_roots: Vec<PathBuf>,

    /// Engine variable (repeatable)
    #[arg(short = 's', long = "set", value_name = "NAME=VALUE")]
    variables: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file and print its result
    Run {
        /// Script to run
        script: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,

        #[command(flatten)]
        log: LogArgs,
    },

    /// Start an interactive session
    Repl {
        /// Script language
        #[arg(long, default_value = "rhai")]
        language: String,

        #[command(flatten)]
        engine: EngineArgs,

        #[command(flatten)]
        log: LogArgs,
    },

    /// Run a script under the debugger, printing every suspension
    Debug {
        /// Script to debug
        script: PathBuf,

        /// Breakpoint as `LINE` in the script or `FILE:LINE` (repeatable)
        #[arg(short, long = "break", value_name = "LOCATION")]
        breakpoints: Vec<String>,

        /// Suspend before the first statement
        #[arg(long)]
        stop_on_entry: bool,

        /// Keep stepping after the first suspension instead of resuming
        #[arg(long)]
        step: bool,

        #[command(flatten)]
        engine: EngineArgs,

        #[command(flatten)]
        log: LogArgs,
    },

    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "scripthost.yaml")]
        config: PathBuf,

        /// Print the resolved configuration as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            script,
            engine,
            log,
        } => {
            init_tracing(&log);
            run_script(&script, &engine).await
        }

        Commands::Repl {
            language,
            engine,
            log,
        } => {
            init_tracing(&log);
            run_repl(&language, &engine).await
        }

        Commands::Debug {
            script,
            breakpoints,
            stop_on_entry,
            step,
            engine,
            log,
        } => {
            init_tracing(&log);
            run_debug(&script, &breakpoints, stop_on_entry, step, &engine).await
        }

        Commands::Validate { config, json } => {
            tracing_subscriber::fmt()
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();

            tracing::info!("Validating configuration: {}", config.display());

            match load_from_file(&config) {
                Ok(cfg) => {
                    tracing::info!("✓ Configuration is valid");
                    tracing::info!("  Engine: {} ({})", cfg.engine.name, cfg.engine.language);
                    tracing::info!(
                        "  Idle timeout: {:?} (terminate on idle: {})",
                        cfg.engine.idle_timeout,
                        cfg.engine.terminate_on_idle
                    );
                    tracing::info!("  Module roots: {}", cfg.engine.modules.roots.len());
                    if json {
                        println!("{}", serde_json::to_string_pretty(&cfg)?);
                    }
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("✗ Configuration validation failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("Scripthost");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

async fn run_script(script: &Path, args: &EngineArgs) -> Result<()> {
    let config = load_config(args)?;
    let engine = ScriptEngine::new(config.engine)?;
    apply_variables(&engine, &args.variables)?;

    tracing::info!(script = %script.display(), engine = engine.name(), "Running script");
    let outcome = engine.submit(ScriptSource::file(script)).await;
    engine.terminate(false);

    let value = outcome.with_context(|| format!("{} failed", script.display()))?;
    print_value(&engine, &value);
    Ok(())
}

async fn run_repl(language: &str, args: &EngineArgs) -> Result<()> {
    let language: ScriptLanguage = language.parse()?;
    let config = load_config(args)?;

    let mut engine_config = if args.config.is_some() {
        config.engine
    } else {
        EngineConfig {
            modules: config.engine.modules,
            ..EngineConfig::repl(language)
        }
    };
    engine_config.language = language;

    let repl = ReplEngine::with_config(engine_config)?;
    // The shell ends the session on :quit or end of input
    repl.set_terminate_on_idle(false, Duration::ZERO);
    apply_variables(&repl, &args.variables)?;

    println!(
        "scripthost {} ({language}), :vars lists variables, :quit exits",
        env!("CARGO_PKG_VERSION")
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        match line.trim() {
            "" => continue,
            ":quit" | ":q" => break,
            ":vars" => {
                let inspector = repl.inspector();
                for (name, value) in repl.variables() {
                    println!("{name} = {}", inspector.display(&value));
                }
            }
            input => {
                let outcome = repl.evaluate(input).await;
                if let Some(echo) = repl.echo(&outcome) {
                    println!("{echo}");
                }
            }
        }
    }

    repl.terminate(false);
    Ok(())
}

async fn run_debug(
    script: &Path,
    breakpoints: &[String],
    stop_on_entry: bool,
    step: bool,
    args: &EngineArgs,
) -> Result<()> {
    let config = load_config(args)?;
    let engine = ScriptEngine::new(config.engine)?;
    apply_variables(&engine, &args.variables)?;

    let mut options = config.debug;
    options.suspend_on_startup |= stop_on_entry;
    let target = DebugTarget::attach(&engine, options)?;

    for location in breakpoints {
        let breakpoint = parse_breakpoint(location, script)?;
        println!("breakpoint {breakpoint}");
        target.add_breakpoint(breakpoint);
    }

    let mut events = target.subscribe();
    let result = engine.submit(ScriptSource::file(script));
    let mut result = std::pin::pin!(result.into_future());

    let outcome = loop {
        tokio::select! {
            outcome = &mut result => break outcome,
            Some(event) = events.recv() => {
                println!("{event}");
                if event.kind != DebugEventKind::Suspend {
                    continue;
                }
                print_stack(&target);
                let resumed = if step { target.step_into() } else { target.resume() };
                if let Err(err) = resumed {
                    tracing::warn!(error = %err, "Failed to resume debug target");
                }
            }
        }
    };

    engine.terminate(false);
    while let Some(event) = events.recv().await {
        println!("{event}");
        if event.kind == DebugEventKind::Terminate {
            break;
        }
    }

    let value = outcome.with_context(|| format!("{} failed", script.display()))?;
    print_value(&engine, &value);
    Ok(())
}

fn load_config(args: &EngineArgs) -> Result<ScriptHostConfig> {
    let mut config = match &args.config {
        Some(path) => load_from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => ScriptHostConfig::default(),
    };

    config
        .engine
        .modules
        .roots
        .extend(args.module_roots.iter().cloned());
    validate(&config)?;
    Ok(config)
}

fn apply_variables(engine: &ScriptEngine, variables: &[String]) -> Result<()> {
    for entry in variables {
        let Some((name, raw)) = entry.split_once('=') else {
            bail!("invalid variable '{entry}', expected NAME=VALUE");
        };
        engine.set_variable(name.trim(), parse_value(raw))?;
    }
    Ok(())
}

/// Interpret a command-line value as an integer, float, boolean or string
fn parse_value(raw: &str) -> Value {
    if let Ok(int) = raw.parse::<i64>() {
        Value::from(int)
    } else if let Ok(float) = raw.parse::<f64>() {
        Value::from(float)
    } else if let Ok(flag) = raw.parse::<bool>() {
        Value::from(flag)
    } else {
        Value::from(raw.to_string())
    }
}

fn parse_breakpoint(location: &str, script: &Path) -> Result<Breakpoint> {
    let (path, line) = if let Ok(line) = location.parse::<usize>() {
        (script, line)
    } else {
        match location
            .rsplit_once(':')
            .and_then(|(path, line)| Some((Path::new(path), line.parse::<usize>().ok()?)))
        {
            Some(parsed) => parsed,
            None => bail!("breakpoint '{location}' needs a line: LINE or FILE:LINE"),
        }
    };

    if line == 0 {
        bail!("breakpoint lines start at 1: '{location}'");
    }
    Ok(Breakpoint::at_file(path, line))
}

fn print_value(engine: &ScriptEngine, value: &Value) {
    if !value.is_unit() {
        println!("{}", engine.inspector().display(value));
    }
}

fn print_stack(target: &DebugTarget) {
    let Ok(stack) = target.stack() else {
        return;
    };
    for frame in &stack {
        println!("  #{} {}", frame.index(), frame.name());
        for variable in frame.variables() {
            println!(
                "      {} = {} ({})",
                variable.name(),
                variable.display(),
                variable.type_name()
            );
        }
    }
}

fn init_tracing(args: &LogArgs) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let registry = tracing_subscriber::registry().with(filter);

    if args.log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("42").as_int().unwrap(), 42);
        assert_eq!(parse_value("1.5").as_float().unwrap(), 1.5);
        assert!(parse_value("true").as_bool().unwrap());
        assert_eq!(parse_value("hello").into_string().unwrap(), "hello");
    }

    #[test]
    fn test_parse_breakpoint() {
        let script = Path::new("main.rhai");
        assert_eq!(
            parse_breakpoint("12", script).unwrap(),
            Breakpoint::at_file(script, 12)
        );
        assert_eq!(
            parse_breakpoint("lib/util.rhai:3", script).unwrap(),
            Breakpoint::at_file("lib/util.rhai", 3)
        );
        assert!(parse_breakpoint("main.rhai:zero", script).is_err());
        assert!(parse_breakpoint("0", script).is_err());
    }

    #[test]
    fn test_parse_breakpoint_with_drive_letter() {
        let script = Path::new("main.rhai");
        assert_eq!(
            parse_breakpoint(r"C:\scripts\x.rhai:3", script).unwrap(),
            Breakpoint::at_file(r"C:\scripts\x.rhai", 3)
        );

        let err = parse_breakpoint(r"C:\scripts\x.rhai", script).unwrap_err();
        assert!(err.to_string().contains("needs a line"));
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "scripthost",
            "run",
            "main.rhai",
            "-I",
            "lib",
            "--set",
            "answer=42",
            "--log-json",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                script,
                engine,
                log,
            } => {
                assert_eq!(script, PathBuf::from("main.rhai"));
                assert_eq!(engine.module_roots, vec![PathBuf::from("lib")]);
                assert_eq!(engine.variables, vec!["answer=42".to_string()]);
                assert!(log.log_json);
            }
            _ => panic!("expected run command"),
        }
    }
}
