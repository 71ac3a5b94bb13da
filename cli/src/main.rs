//! file: cli/src/main.rs
//! description: command-line front end for running and inspecting `.yakc` files.

mod disassembler;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use console::style;
use serde::Serialize;
use yakvm_core::vm::host;
use yakvm_core::{
    generate_error_report, CodeCache, CodesMarshaller, Context, Program, Script, VirtualMachine, VmConfig, VmError,
    YakErrorExt, ENGINE_VERSION,
};

#[derive(Parser)]
#[command(name = "yakvm", version, about = "Runs and inspects compiled yak bytecode")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a .yakc file and print its result.
    Run {
        file: PathBuf,
        #[command(flatten)]
        key: KeyArg,
        /// Print every instruction before it executes.
        #[arg(long)]
        trace: bool,
    },
    /// Print the instruction listing of a .yakc file.
    Disasm {
        file: PathBuf,
        #[command(flatten)]
        key: KeyArg,
    },
    /// Inspect or empty the on-disk bytecode cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Args)]
struct KeyArg {
    /// 16-byte SM4 key as 32 hex characters.
    #[arg(long, value_name = "HEX")]
    key: Option<String>,
}

#[derive(Subcommand)]
enum CacheAction {
    Info {
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Emit the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    Clear {
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct CacheInfo {
    dir: PathBuf,
    engine: &'static str,
    entries: usize,
    bytes: u64,
}

/// Errors reported before or around the VM itself.
#[derive(Debug)]
enum CliError {
    Usage(String),
    Script(Box<dyn YakErrorExt>),
    Vm(VmError),
}

impl From<VmError> for CliError {
    fn from(err: VmError) -> Self {
        CliError::Vm(err)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match dispatch(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err {
                CliError::Usage(msg) => eprintln!("{} {}", style("error:").red().bold(), msg),
                CliError::Script(e) => eprintln!("{}", generate_error_report(e.as_ref())),
                CliError::Vm(e) => eprintln!("{}", generate_error_report(&e)),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    });
    builder.parse_default_env();
    let _ = builder.try_init();
}

fn dispatch(command: Command) -> Result<(), CliError> {
    match command {
        Command::Run { file, key, trace } => {
            let program = load_program(file, &key)?;
            let config = VmConfig::from_env();
            let trace = trace || config.trace;
            let vm = VirtualMachine::new(config.with_trace(trace));
            host::install(&vm);
            let ctx = Context::background();
            let result = vm.exec_program(&ctx, &program)?;
            vm.async_wait(&ctx)?;
            if !result.is_undefined() {
                println!("{}", result);
            }
            Ok(())
        }
        Command::Disasm { file, key } => {
            let program = load_program(file, &key)?;
            print!("{}", disassembler::disassemble(&program));
            Ok(())
        }
        Command::Cache { action } => match action {
            CacheAction::Info { dir, json } => {
                let cache = open_cache(dir)?;
                let entries = cache.disk_entries();
                let info = CacheInfo {
                    dir: cache.dir().map(PathBuf::from).unwrap_or_default(),
                    engine: ENGINE_VERSION,
                    entries: entries.len(),
                    bytes: entries.iter().filter_map(|p| std::fs::metadata(p).ok()).map(|m| m.len()).sum(),
                };
                if json {
                    let text = serde_json::to_string_pretty(&info).map_err(|e| CliError::Usage(e.to_string()))?;
                    println!("{}", text);
                } else {
                    println!("{} {}", style("cache:").bold(), info.dir.display());
                    println!("{} {}", style("engine:").bold(), info.engine);
                    println!("{} {} ({} bytes)", style("entries:").bold(), info.entries, info.bytes);
                }
                Ok(())
            }
            CacheAction::Clear { dir } => {
                let cache = open_cache(dir)?;
                let removed = cache.clear();
                println!("removed {} file(s)", removed);
                Ok(())
            }
        },
    }
}

fn load_program(file: PathBuf, key: &KeyArg) -> Result<Program, CliError> {
    let script = Script::new(file).map_err(CliError::Script)?;
    if !script.is_yakc() {
        return Err(CliError::Usage(format!(
            "{} is not a .yakc file; compile it with a front end first",
            script.path.display()
        )));
    }
    let marshaller = match &key.key {
        Some(hex) => CodesMarshaller::with_key(parse_key(hex)?),
        None => CodesMarshaller::new(),
    };
    log::debug!("decoding {} ({} bytes)", script.name, script.content.len());
    Ok(marshaller.unmarshal(&script.content)?)
}

fn parse_key(text: &str) -> Result<[u8; 16], CliError> {
    let bytes = hex::decode(text.trim()).map_err(|e| CliError::Usage(format!("invalid key: {}", e)))?;
    <[u8; 16]>::try_from(bytes.as_slice())
        .map_err(|_| CliError::Usage(format!("invalid key: expected 16 bytes, got {}", bytes.len())))
}

fn open_cache(dir: Option<PathBuf>) -> Result<CodeCache, CliError> {
    let config = VmConfig::from_env();
    let dir = dir
        .or(config.cache_dir)
        .ok_or_else(|| CliError::Usage("no cache directory; pass --dir or set YAKVM_CACHE_DIR".to_string()))?;
    Ok(CodeCache::new(Some(dir), config.min_cache_len))
}
