use crate::expression_tree::errors::{ExprError, Result};
use chrono::Local;
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

/// parses "debug", "info", "warn", "error" or "off"
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    match level {
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        "off" => Ok(LevelFilter::Off),
        other => Err(ExprError::Config(format!(
            "loglevel must be debug, info, warn, error or off, got {}",
            other
        ))),
    }
}

/// Log file created on the first record written to it. A logger that is never installed
/// (another one already is) therefore leaves nothing on disk.
pub struct LazyLogFile {
    path: PathBuf,
    file: Option<File>,
}

impl LazyLogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(File::create(&self.path)?);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other(format!("log file {} unavailable", self.path.display())))
    }
}

impl Write for LazyLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Initialise terminal logging, plus a `log_<date>_<time>.txt` file when `log_file` is set.
/// Level defaults to info. Returns `Ok(false)` if a logger was already installed; the log
/// file is only created once the installed logger writes to it.
pub fn init_logger(level: Option<&str>, log_file: bool) -> Result<bool> {
    let level = match level {
        Some(level) => parse_level(level)?,
        None => LevelFilter::Info,
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if log_file {
        let date_and_time = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let file = LazyLogFile::new(format!("log_{}.txt", date_and_time));
        loggers.push(WriteLogger::new(level, Config::default(), file));
    }
    Ok(CombinedLogger::init(loggers).is_ok())
}
