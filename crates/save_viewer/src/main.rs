use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use save_viewer::{run, usage_text, CommandKind, CommonOptions};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    init_tracing();
    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::from(1)
        }
    }
}

fn run_cli() -> Result<(), String> {
    let args = env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() {
        return Err(usage_text());
    }

    let mut options = CommonOptions::default();
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "--dir" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --dir".to_string())?;
                options.dir = Some(PathBuf::from(value));
                index += 2;
            }
            _ => break,
        }
    }

    let command = args
        .get(index)
        .ok_or_else(|| "missing subcommand".to_string())?
        .as_str();
    let command_args = &args[(index + 1)..];

    let kind = match command {
        "-h" | "--help" | "help" => CommandKind::Help,
        "list" => {
            if !command_args.is_empty() {
                return Err("list takes no arguments".to_string());
            }
            CommandKind::List
        }
        "stats" => {
            if !command_args.is_empty() {
                return Err("stats takes no arguments".to_string());
            }
            CommandKind::Stats
        }
        "inspect" => CommandKind::Inspect {
            file: single_file(command, command_args)?,
        },
        "benchmark" => CommandKind::Benchmark {
            file: single_file(command, command_args)?,
        },
        "validate" => {
            let mut verbose = false;
            let mut file = None;
            for arg in command_args {
                match arg.as_str() {
                    "--verbose" | "-v" => verbose = true,
                    flag if flag.starts_with('-') => {
                        return Err(format!(
                            "unknown validate argument '{flag}' (expected --verbose)"
                        ));
                    }
                    name if file.is_none() => file = Some(name.to_string()),
                    extra => return Err(format!("unexpected argument '{extra}'")),
                }
            }
            CommandKind::Validate {
                file: file.ok_or_else(|| "validate requires a file name".to_string())?,
                verbose,
            }
        }
        other => return Err(format!("unknown subcommand '{other}'\n\n{}", usage_text())),
    };

    run(kind, options, &mut io::stdout())
}

fn single_file(command: &str, args: &[String]) -> Result<String, String> {
    match args {
        [file] => Ok(file.clone()),
        [] => Err(format!("{command} requires a file name")),
        _ => Err(format!("{command} takes exactly one file name")),
    }
}

/// Manager logs go to stderr at `warn` unless `RUST_LOG` says otherwise.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}
