use anyhow::Context;
use log::LevelFilter;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// `<log_dir>/dewmail-YYYY-MM-DD.log` for the local date
pub fn log_file_path(log_dir: &Path, date: chrono::NaiveDate) -> PathBuf {
    log_dir.join(format!("dewmail-{}.log", date.format("%Y-%m-%d")))
}

/// Info by default, debug when verbose; `RUST_LOG` still applies on top.
/// With a `log_dir`, output is appended to the day's log file.
pub fn init(verbose: bool, log_dir: Option<&str>) -> anyhow::Result<()> {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level).parse_default_env();

    if let Some(dir) = log_dir {
        let path = log_file_path(Path::new(dir), chrono::Local::now().date_naive());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .context("Logger already initialised")?;
    Ok(())
}
