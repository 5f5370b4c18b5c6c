//! Log output for a run: stderr, an append-only log file and the system logger.

use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, Metadata};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub const SYSLOG_SOCKET: &str = "/dev/log";
const SYSLOG_TAG: &str = "anvil";
const FACILITY_DAEMON: u8 = 3;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub verbose: bool,
    /// Append-only log file; `None` logs to stderr only
    pub file: Option<PathBuf>,
    pub syslog: bool,
}

/// Keeps the file writer flushing until dropped.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber. Sinks that cannot be opened are skipped with a note on stderr.
pub fn init(options: &LogOptions) -> LogGuard {
    let default_level = if options.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match options.file.as_deref().map(open_append) {
        Some(Ok(file)) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err((path, e))) => {
            eprintln!("anvil: not logging to {}: {}", path.display(), e);
            (None, None)
        }
        None => (None, None),
    };

    let syslog_layer = if options.syslog {
        match Syslog::connect(Path::new(SYSLOG_SOCKET), SYSLOG_TAG) {
            Ok(syslog) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .without_time()
                    .with_target(false)
                    .with_level(false)
                    .with_writer(syslog),
            ),
            Err(e) => {
                eprintln!("anvil: system logger unavailable at {}: {}", SYSLOG_SOCKET, e);
                None
            }
        }
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(syslog_layer)
        .try_init();

    LogGuard { _file: guard }
}

fn open_append(path: &Path) -> Result<std::fs::File, (PathBuf, std::io::Error)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| (path.to_path_buf(), e))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| (path.to_path_buf(), e))
}

/// RFC 3164 datagrams to the local system logger.
#[derive(Clone)]
pub struct Syslog {
    socket: Arc<UnixDatagram>,
    tag: String,
}

impl Syslog {
    pub fn connect(path: &Path, tag: &str) -> std::io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        Ok(Self::from_socket(socket, tag))
    }

    pub fn from_socket(socket: UnixDatagram, tag: &str) -> Self {
        Self {
            socket: Arc::new(socket),
            tag: tag.to_string(),
        }
    }

    fn record(&self, level: Level) -> SyslogRecord {
        SyslogRecord {
            socket: self.socket.clone(),
            header: format!(
                "<{}>{}[{}]: ",
                priority(level),
                self.tag,
                std::process::id()
            ),
            buf: Vec::new(),
        }
    }
}

fn priority(level: Level) -> u8 {
    let severity = match level {
        Level::ERROR => 3,
        Level::WARN => 4,
        Level::INFO => 6,
        Level::DEBUG | Level::TRACE => 7,
    };
    FACILITY_DAEMON * 8 + severity
}

/// One formatted event, sent as a single datagram when dropped.
pub struct SyslogRecord {
    socket: Arc<UnixDatagram>,
    header: String,
    buf: Vec<u8>,
}

impl Write for SyslogRecord {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogRecord {
    fn drop(&mut self) {
        let message = String::from_utf8_lossy(&self.buf);
        let message = message.trim_end();
        if message.is_empty() {
            return;
        }
        let datagram = format!("{}{}", self.header, message);
        // Logging must never fail the run.
        let _ = self.socket.send(datagram.as_bytes());
    }
}

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogRecord;

    fn make_writer(&'a self) -> Self::Writer {
        self.record(Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.record(*meta.level())
    }
}
