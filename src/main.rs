//! Rill CLI and REPL
//!
//! Usage:
//!   rill <script.rill>       - Compile and run a script's entry function
//!   rill                     - Start interactive REPL
//!   rill --help              - Show help message

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use rill::lexer::{ScannerSet, Tokenizer};
use rill::token::TokenKind;
use rill::{CompileError, CompileOptions, Mode, Session, Value, VERSION};

const EXIT_USAGE: u8 = 64;
const EXIT_DATA: u8 = 65;
const EXIT_SOFTWARE: u8 = 70;
const EXIT_NO_INPUT: u8 = 74;

const LOG_ENV: &str = "RILL_LOG";
const REPL_SOURCE: &str = "<repl>";

#[derive(Debug, Parser)]
#[command(name = "rill", version, about = "An embeddable, statically typed scripting runtime")]
struct Cli {
    /// Script to run. Starts the REPL when omitted.
    script: Option<PathBuf>,

    /// Zero-argument function to call after compiling.
    #[arg(long, default_value = "main")]
    entry: String,

    /// Compile without debug metadata.
    #[arg(long)]
    release: bool,

    /// Do not print the bytecode listing before running.
    #[arg(long)]
    no_disassemble: bool,

    /// Log filter directive, e.g. `rill::vm=trace`. Overrides RILL_LOG.
    #[arg(long, value_name = "FILTER")]
    log: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid log filter '{directive}': {message}")]
    LogFilter { directive: String, message: String },

    #[error("cannot read file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not compile '{path}' due to {count} previous error(s)")]
    Compile { path: PathBuf, count: usize },

    #[error("no entry function '{0}' taking no arguments")]
    MissingEntry(String),

    #[error("execution of '{0}' failed")]
    Runtime(String),

    #[error("REPL failed: {0}")]
    Repl(#[from] ReadlineError),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            CliError::LogFilter { .. } => EXIT_USAGE,
            CliError::Read { .. } => EXIT_NO_INPUT,
            CliError::Compile { .. } | CliError::MissingEntry(_) => EXIT_DATA,
            CliError::Runtime(_) | CliError::Repl(_) => EXIT_SOFTWARE,
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_USAGE),
            };
        }
    };

    let result = init_logging(cli.log.as_deref()).and_then(|()| match &cli.script {
        Some(path) => run_file(&cli, path),
        None => run_repl(),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Install a stderr fmt subscriber filtered by `--log` or `RILL_LOG`.
fn init_logging(directive: Option<&str>) -> Result<(), CliError> {
    let filter = match directive {
        Some(directive) => EnvFilter::try_new(directive).map_err(|e| CliError::LogFilter {
            directive: directive.to_string(),
            message: e.to_string(),
        })?,
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .compact()
        .with_target(true)
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .init();
    Ok(())
}

fn run_file(cli: &Cli, path: &PathBuf) -> Result<(), CliError> {
    let source = fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.clone(),
        source,
    })?;
    let mode = if cli.release { Mode::Release } else { Mode::Debug };
    let name = path.display().to_string();
    info!(target: "rill::cli", script = %name, ?mode, "running script");

    let mut session = Session::new();
    let errors = session.compile_source(&name, &source, mode, CompileOptions::default());
    if !errors.is_empty() {
        report_compile_errors(&session, &errors);
        return Err(CliError::Compile {
            path: path.clone(),
            count: errors.len(),
        });
    }

    if !cli.no_disassemble {
        println!("{}", session.disassemble());
    }

    if !session.has_entry(&cli.entry) {
        return Err(CliError::MissingEntry(cli.entry.clone()));
    }

    match session.call_entry(&cli.entry) {
        Ok(value) => {
            print_value(&value);
            Ok(())
        }
        Err(e) => {
            eprint!("{}", session.format_runtime_error(&e).red());
            Err(CliError::Runtime(cli.entry.clone()))
        }
    }
}

fn report_compile_errors(session: &Session, errors: &[CompileError]) {
    for error in errors {
        eprint!("{}", session.format_compile_error(error).red());
    }
}

fn print_value(value: &Value) {
    if !matches!(value, Value::Unit) {
        println!("{} {}", "=>".dimmed(), value.to_string().cyan());
    }
}

fn run_repl() -> Result<(), CliError> {
    println!("{} {} - {}",
        "Rill".cyan().bold(),
        VERSION.cyan(),
        "an embeddable typed scripting runtime".dimmed()
    );
    println!("Type {} to exit, {} for help. End a block with two blank lines.\n",
        "exit".yellow(),
        "help".yellow()
    );

    let mut rl = DefaultEditor::new()?;
    let mut session = Session::new();
    let mut block = String::new();
    let mut blank_lines = 0;

    loop {
        let prompt = if block.is_empty() {
            format!("{} ", "rill>".green().bold())
        } else {
            format!("{} ", "  ...".dimmed())
        };

        match rl.readline(&prompt) {
            Ok(line) => {
                if block.is_empty() {
                    match line.trim() {
                        "" => continue,
                        "exit" | "quit" => {
                            println!("{}", "Goodbye!".cyan());
                            break;
                        }
                        "help" => {
                            print_repl_help();
                            continue;
                        }
                        _ => {}
                    }
                }

                if line.trim().is_empty() {
                    blank_lines += 1;
                    if blank_lines < 2 {
                        block.push('\n');
                        continue;
                    }
                    let text = std::mem::take(&mut block);
                    blank_lines = 0;
                    let _ = rl.add_history_entry(text.trim());
                    run_block(&mut session, text.trim_end());
                } else {
                    blank_lines = 0;
                    block.push_str(&line);
                    block.push('\n');
                }
            }
            Err(ReadlineError::Interrupted) => {
                block.clear();
                blank_lines = 0;
                println!("{}", "^C".dimmed());
            }
            Err(ReadlineError::Eof) => {
                println!("{}", "Goodbye!".cyan());
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Compile and run one REPL block as an independent unit. Declarations are
/// run through `main`; anything else is evaluated as an expression.
fn run_block(session: &mut Session, text: &str) {
    let declarations = starts_with_declaration(text);
    debug!(target: "rill::cli", declarations, bytes = text.len(), "repl block");

    let errors = if declarations {
        session.compile_source(REPL_SOURCE, text, Mode::Debug, CompileOptions::default())
    } else {
        session.compile_expression(text)
    };
    if !errors.is_empty() {
        report_compile_errors(session, &errors);
        return;
    }

    let result = if !declarations {
        session.evaluate()
    } else if session.has_entry("main") {
        session.call_entry("main")
    } else {
        println!("{}", "Compiled. Define 'fn main()' to run a block.".dimmed());
        return;
    };

    match result {
        Ok(value) => print_value(&value),
        Err(e) => eprint!("{}", session.format_runtime_error(&e).red()),
    }
}

/// Whether the block's first token is the `fn` keyword.
fn starts_with_declaration(text: &str) -> bool {
    let scanners = ScannerSet::language();
    Tokenizer::new(text, &scanners).next_token().kind == TokenKind::Fn
}

fn print_repl_help() {
    println!("{}", "REPL Commands:".yellow());
    println!("  exit, quit   Exit the REPL");
    println!("  help         Show this help\n");
    println!("{}", "Blocks:".yellow());
    println!("  A block ends after two consecutive blank lines.");
    println!("  Blocks starting with 'fn' are compiled and 'main' is called.");
    println!("  Any other block is evaluated as an expression.\n");
    println!("{}", "Language Examples:".yellow());
    println!("  {{ let a = 4 a + 5 }}");
    println!("  if 3 > 3 {{ 4 }} else {{ 5 }}");
    println!("  fn main() -> int {{ mut n = 0 while n < 3 {{ n = n + 1 }} n }}");
}
