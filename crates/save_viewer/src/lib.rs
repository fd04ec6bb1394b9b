use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use persistence::compression::{benchmark, is_compressed_block, unpack, BenchmarkEntry, DEFAULT_LEVEL};
use persistence::document::decode_save_bytes;
use persistence::{SaveFileInfo, SaveManager, SaveManagerConfig, ValidationReport};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommonOptions {
    /// Overrides `PERSIST_SAVE_DIR` and the built-in `./saves`.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    List,
    Inspect { file: String },
    Validate { file: String, verbose: bool },
    Stats,
    Benchmark { file: String },
    Help,
}

pub fn run<W: Write>(kind: CommandKind, opts: CommonOptions, stdout: &mut W) -> Result<(), String> {
    if kind == CommandKind::Help {
        return emit(stdout, &usage_text());
    }
    let manager = open_manager(&opts)?;
    match kind {
        CommandKind::Help => Ok(()),
        CommandKind::List => list(&manager, stdout),
        CommandKind::Inspect { file } => inspect(&manager, &file, stdout),
        CommandKind::Validate { file, verbose } => validate(&manager, &file, verbose, stdout),
        CommandKind::Stats => stats(&manager, stdout),
        CommandKind::Benchmark { file } => run_benchmark(&manager, &file, stdout),
    }
}

pub fn usage_text() -> String {
    [
        "save_viewer - inspect simulation save files",
        "",
        "Usage:",
        "  save_viewer [--dir <path>] list",
        "  save_viewer [--dir <path>] inspect <file>",
        "  save_viewer [--dir <path>] validate [--verbose] <file>",
        "  save_viewer [--dir <path>] stats",
        "  save_viewer [--dir <path>] benchmark <file>",
        "  save_viewer help",
        "",
        "Defaults:",
        "  --dir $PERSIST_SAVE_DIR, else ./saves",
    ]
    .join("\n")
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0usize;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

pub fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();
    if micros < 1_000 {
        format!("{micros} us")
    } else if micros < 1_000_000 {
        format!("{:.2} ms", micros as f64 / 1_000.0)
    } else {
        format!("{:.2} s", duration.as_secs_f64())
    }
}

fn open_manager(opts: &CommonOptions) -> Result<SaveManager, String> {
    let mut config = SaveManagerConfig::default().with_env_overrides();
    if let Some(dir) = &opts.dir {
        config = config.with_save_dir(dir);
    }
    // Inspection must not rewrite anything it looks at.
    config.enable_auto_backup = false;
    if !config.save_dir.is_dir() {
        return Err(format!(
            "save directory '{}' does not exist",
            config.save_dir.display()
        ));
    }
    SaveManager::new(config).map_err(|error| format!("failed to open save directory: {error}"))
}

fn list<W: Write>(manager: &SaveManager, stdout: &mut W) -> Result<(), String> {
    let names = manager.save_file_list().map_err(|error| error.to_string())?;
    if names.is_empty() {
        return emit(
            stdout,
            &format!("No save files found in {}", manager.save_dir().display()),
        );
    }

    emit(stdout, &format!("Save files in {}:", manager.save_dir().display()))?;
    emit(
        stdout,
        &format!("{:<32} {:>10} {:>8}  {}", "NAME", "SIZE", "VERSION", "MODIFIED"),
    )?;
    for name in &names {
        let line = match manager.save_file_info(name) {
            Ok(info) => format!(
                "{:<32} {:>10} {:>8}  {}",
                info.name,
                format_bytes(info.size),
                info.version
                    .map(|version| version.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                format_modified(info.modified),
            ),
            Err(error) => format!("{name:<32} error: {error}"),
        };
        emit(stdout, &line)?;
    }
    emit(stdout, &format!("{} save file(s)", names.len()))
}

fn inspect<W: Write>(manager: &SaveManager, file: &str, stdout: &mut W) -> Result<(), String> {
    let info = manager.save_file_info(file).map_err(|error| error.to_string())?;
    write_info(&info, stdout)?;
    if let Some(error) = &info.error {
        return Err(format!("cannot read {}: {error}", info.name));
    }

    let report = manager.validate_save(file).map_err(|error| error.to_string())?;
    emit(stdout, "")?;
    emit(stdout, &format!("Validation: {}", report.summary()))?;
    write_issues(&report, stdout)?;

    let bytes = fs::read(&info.path)
        .map_err(|error| format!("failed to read '{}': {error}", info.path.display()))?;
    let document = decode_save_bytes(&bytes).map_err(|error| error.to_string())?;
    if let Some(header) = document.get("header") {
        let preview = serde_json::to_string_pretty(header)
            .map_err(|error| format!("failed to render header: {error}"))?;
        emit(stdout, "")?;
        emit(stdout, "Header:")?;
        emit(stdout, &preview)?;
    }
    Ok(())
}

fn validate<W: Write>(
    manager: &SaveManager,
    file: &str,
    verbose: bool,
    stdout: &mut W,
) -> Result<(), String> {
    let report = manager.validate_save(file).map_err(|error| error.to_string())?;
    let status = if report.is_valid() { "PASSED" } else { "FAILED" };
    emit(stdout, &format!("Validation {status}: {file}"))?;
    emit(stdout, &format!("Issues: {}", report.issues.len()))?;
    emit(stdout, &format!("Time: {}", format_duration(report.validation_time)))?;
    if verbose {
        emit(stdout, "")?;
        emit(stdout, report.generate_report().trim_end())?;
    } else {
        write_issues(&report, stdout)?;
    }

    if report.is_valid() {
        return Ok(());
    }
    let mut message = format!("validation failed: {}", report.summary());
    if let Some(fix) = report.first_suggested_fix() {
        message.push_str(&format!(" ({fix})"));
    }
    Err(message)
}

fn stats<W: Write>(manager: &SaveManager, stdout: &mut W) -> Result<(), String> {
    let names = manager.save_file_list().map_err(|error| error.to_string())?;
    let mut total_bytes = 0u64;
    let mut valid = 0usize;
    for name in &names {
        total_bytes += manager.save_file_size(name).unwrap_or(0);
        if manager
            .validate_save(name)
            .is_ok_and(|report| report.is_valid())
        {
            valid += 1;
        }
    }

    emit(stdout, &format!("Directory: {}", manager.save_dir().display()))?;
    emit(stdout, &format!("Save files: {} ({} valid)", names.len(), valid))?;
    emit(stdout, &format!("Total size: {}", format_bytes(total_bytes)))?;
    let rendered = serde_json::to_string_pretty(&manager.save_stats().to_json())
        .map_err(|error| format!("failed to render stats: {error}"))?;
    emit(stdout, "")?;
    emit(stdout, "Manager statistics:")?;
    emit(stdout, &rendered)
}

fn run_benchmark<W: Write>(manager: &SaveManager, file: &str, stdout: &mut W) -> Result<(), String> {
    let info = manager.save_file_info(file).map_err(|error| error.to_string())?;
    let stored = fs::read(&info.path)
        .map_err(|error| format!("failed to read '{}': {error}", info.path.display()))?;
    let data = if is_compressed_block(&stored) {
        unpack(&stored).map_err(|error| format!("failed to unpack '{}': {error}", info.name))?
    } else {
        stored
    };

    emit(
        stdout,
        &format!("Benchmark: {} ({})", info.name, format_bytes(data.len() as u64)),
    )?;
    emit(
        stdout,
        &format!(
            "{:<10} {:<10} {:>10} {:>7} {:>12} {:>12}  {}",
            "ALGORITHM", "STORED AS", "SIZE", "RATIO", "COMPRESS", "DECOMPRESS", "OK"
        ),
    )?;
    for entry in benchmark(&data, DEFAULT_LEVEL) {
        emit(stdout, &benchmark_row(&entry))?;
    }
    Ok(())
}

fn benchmark_row(entry: &BenchmarkEntry) -> String {
    format!(
        "{:<10} {:<10} {:>10} {:>7.3} {:>12} {:>12}  {}",
        entry.algorithm.name(),
        entry.stored_as.name(),
        format_bytes(entry.compressed_size as u64),
        entry.ratio,
        format_duration(micros(entry.compress_micros)),
        format_duration(micros(entry.decompress_micros)),
        if entry.round_trip_ok { "yes" } else { "NO" },
    )
}

fn micros(value: u128) -> Duration {
    Duration::from_micros(u64::try_from(value).unwrap_or(u64::MAX))
}

fn write_info<W: Write>(info: &SaveFileInfo, stdout: &mut W) -> Result<(), String> {
    emit(stdout, &format!("File: {}", info.name))?;
    emit(stdout, &format!("Path: {}", info.path.display()))?;
    emit(stdout, &format!("Size: {} ({} bytes)", format_bytes(info.size), info.size))?;
    emit(stdout, &format!("Modified: {}", format_modified(info.modified)))?;
    emit(stdout, &format!("Compressed: {}", if info.compressed { "yes" } else { "no" }))?;
    if let Some(version) = &info.version {
        emit(stdout, &format!("Version: {version}"))?;
    }
    if let Some(product) = &info.product {
        emit(stdout, &format!("Product: {product}"))?;
    }
    if let Some(timestamp) = info.timestamp {
        let rendered = DateTime::from_timestamp(timestamp, 0)
            .map(|time| time.with_timezone(&Local).format(TIME_FORMAT).to_string())
            .unwrap_or_else(|| timestamp.to_string());
        emit(stdout, &format!("Saved at: {rendered}"))?;
    }
    let checksum = match info.checksum_valid {
        Some(true) => "valid",
        Some(false) => "MISMATCH",
        None => "not present",
    };
    emit(stdout, &format!("Checksum: {checksum}"))?;
    emit(
        stdout,
        &format!("Systems ({}): {}", info.systems.len(), info.systems.join(", ")),
    )
}

fn write_issues<W: Write>(report: &ValidationReport, stdout: &mut W) -> Result<(), String> {
    for issue in &report.issues {
        let mut line = format!("  [{}] {}", issue.severity.as_str(), issue.validator);
        if !issue.field_path.is_empty() {
            line.push_str(&format!(" at {}", issue.field_path));
        }
        line.push_str(&format!(": {}", issue.message));
        emit(stdout, &line)?;
    }
    Ok(())
}

fn format_modified(modified: Option<SystemTime>) -> String {
    modified
        .map(|time| DateTime::<Local>::from(time).format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn emit<W: Write>(stdout: &mut W, line: &str) -> Result<(), String> {
    writeln!(stdout, "{line}").map_err(|error| format!("failed to write output: {error}"))
}
