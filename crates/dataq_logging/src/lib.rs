//! Shared logging utilities and well-known directories for DataQ binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "dataq=info,dataq_worker=info,dataq_queue=info,dataq_cas=info,dataq_plugin=info";
const ROTATED_LOG_FILES: usize = 4;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Environment variable overriding the DataQ home directory
pub const HOME_ENV: &str = "DATAQ_HOME";

/// Logging configuration shared by DataQ binaries.
pub struct LogConfig<'a> {
    /// File stem of the log under [`logs_dir`]
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a rolling file writer and stderr output.
///
/// Plugins must not call this: their stdout is the protocol channel and
/// anything on stderr is reported back to the worker as an error.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = logs_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create logs directory: {}", log_dir.display()))?;
    let file_writer = LogFileWriter::open(&log_dir, config.app_name)?;

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        file_filter.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// DataQ home: `$DATAQ_HOME`, else `<config dir>/dataq`.
pub fn dataq_home() -> PathBuf {
    if let Ok(override_path) = std::env::var(HOME_ENV) {
        if !override_path.is_empty() {
            return PathBuf::from(override_path);
        }
    }
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dataq")
}

/// Default config file: `<home>/config.yaml`
pub fn config_file() -> PathBuf {
    dataq_home().join("config.yaml")
}

/// Default CAS directory: `<home>/data`
pub fn data_dir() -> PathBuf {
    dataq_home().join("data")
}

/// Default state directory: `<home>/state`
pub fn state_dir() -> PathBuf {
    dataq_home().join("state")
}

/// Logs directory: `<home>/logs`
pub fn logs_dir() -> PathBuf {
    dataq_home().join("logs")
}

/// Size-capped log file. When a write would push it past `max_size` the file
/// becomes `<name>.1`, older generations shift up one, and anything beyond
/// `keep` generations is deleted.
struct RotatingLog {
    path: PathBuf,
    keep: usize,
    max_size: u64,
    file: File,
    size: u64,
}

impl RotatingLog {
    fn open(path: PathBuf, keep: usize, max_size: u64) -> io::Result<Self> {
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            keep,
            max_size,
            file,
            size,
        })
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        for n in (1..=self.keep).rev() {
            let older = self.generation(n);
            if !older.exists() {
                continue;
            }
            if n == self.keep {
                fs::remove_file(&older)?;
            } else {
                fs::rename(&older, self.generation(n + 1))?;
            }
        }
        if self.keep > 0 {
            fs::rename(&self.path, self.generation(1))?;
        } else {
            fs::remove_file(&self.path)?;
        }
        self.file = open_append(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size > 0 && self.size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Handle to the shared log file; each tracing event writes through a clone.
#[derive(Clone)]
struct LogFileWriter(Arc<Mutex<RotatingLog>>);

impl LogFileWriter {
    fn open(dir: &Path, stem: &str) -> Result<Self> {
        let path = dir.join(format!("{}.log", stem));
        let log = RotatingLog::open(path.clone(), ROTATED_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        Ok(Self(Arc::new(Mutex::new(log))))
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, RotatingLog>> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rotation_keeps_bounded_generations() {
        let tmp = TempDir::new().unwrap();
        let mut log = RotatingLog::open(tmp.path().join("dataq.log"), 2, 16).unwrap();

        for line in 0..6 {
            // One write per event, as the fmt layer does
            log.write_all(format!("line {:02} padding\n", line).as_bytes()).unwrap();
        }
        log.flush().unwrap();

        let read = |name: &str| fs::read_to_string(tmp.path().join(name)).unwrap();
        assert_eq!(read("dataq.log"), "line 05 padding\n");
        assert_eq!(read("dataq.log.1"), "line 04 padding\n");
        assert_eq!(read("dataq.log.2"), "line 03 padding\n");
        assert!(!tmp.path().join("dataq.log.3").exists());
    }

    #[test]
    fn test_reopen_appends() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dataq.log");
        {
            let mut log = RotatingLog::open(path.clone(), 2, 1024).unwrap();
            log.write_all(b"first\n").unwrap();
        }
        let mut log = RotatingLog::open(path.clone(), 2, 1024).unwrap();
        log.write_all(b"second\n").unwrap();
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_writer_clones_share_one_file() {
        let tmp = TempDir::new().unwrap();
        let writer = LogFileWriter::open(tmp.path(), "dataq").unwrap();

        let mut a = tracing_subscriber::fmt::MakeWriter::make_writer(&writer);
        let mut b = writer.clone();
        a.write_all(b"from a\n").unwrap();
        b.write_all(b"from b\n").unwrap();
        b.flush().unwrap();

        let content = fs::read_to_string(tmp.path().join("dataq.log")).unwrap();
        assert_eq!(content, "from a\nfrom b\n");
    }
}
