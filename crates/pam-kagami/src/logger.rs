use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use kagami_core::audit::{AuditEvent, AuditSink};
use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::{Level, Metadata, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "KAGAMI_PAM_LOG";

type SyslogLogger = Logger<LoggerBackend, Formatter3164>;

/// Syslog (`LOG_AUTHPRIV`) logger shared by the PAM entry point, the audit
/// trail and the tracing subscriber. Falls back to stderr when syslog is
/// unreachable.
pub struct PamLogger {
    service: String,
    logger: Mutex<Option<SyslogLogger>>,
}

impl PamLogger {
    pub fn new(service: &str) -> Self {
        let formatter = Formatter3164 {
            facility: Facility::LOG_AUTHPRIV,
            hostname: None,
            process: "pam_kagami".into(),
            pid: std::process::id(),
        };
        Self {
            service: service.to_string(),
            logger: Mutex::new(syslog::unix(formatter).ok()),
        }
    }

    pub fn info(&self, message: &str) {
        self.send(|logger, msg| logger.info(msg), "INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.send(|logger, msg| logger.warning(msg), "WARN", message);
    }

    pub fn error(&self, message: &str) {
        self.send(|logger, msg| logger.err(msg), "ERROR", message);
    }

    pub fn debug(&self, message: &str) {
        self.send(|logger, msg| logger.debug(msg), "DEBUG", message);
    }

    pub fn log(&self, level: Level, message: &str) {
        match severity(level) {
            "ERROR" => self.error(message),
            "WARN" => self.warn(message),
            "INFO" => self.info(message),
            _ => self.debug(message),
        }
    }

    fn send<F>(&self, mut emit: F, level: &str, message: &str)
    where
        F: FnMut(&mut SyslogLogger, &str) -> syslog::Result<()>,
    {
        let formatted = format!("[service={}] {}", self.service, message);
        let mut guard = self.logger.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(logger) = guard.as_mut() {
            let _ = emit(logger, &formatted);
        } else {
            eprintln!("pam_kagami {level}: {formatted}");
        }
    }
}

impl AuditSink for PamLogger {
    fn record(&self, event: AuditEvent) {
        let line = event.to_string();
        if event.is_alert() {
            self.warn(&line);
        } else {
            self.info(&line);
        }
    }
}

fn severity(level: Level) -> &'static str {
    match level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        _ => "DEBUG",
    }
}

/// Routes formatted `tracing` events into the [`PamLogger`], one syslog
/// record per line at the event's level.
#[derive(Clone)]
pub struct SyslogMakeWriter {
    logger: Arc<PamLogger>,
}

impl SyslogMakeWriter {
    pub fn new(logger: Arc<PamLogger>) -> Self {
        Self { logger }
    }
}

pub struct SyslogWriter {
    logger: Arc<PamLogger>,
    level: Level,
    buffer: Vec<u8>,
}

impl io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        for line in buffered_lines(&self.buffer) {
            self.logger.log(self.level, &line);
        }
    }
}

fn buffered_lines(buffer: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(buffer)
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter {
            logger: Arc::clone(&self.logger),
            level: Level::INFO,
            buffer: Vec::new(),
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter {
            logger: Arc::clone(&self.logger),
            level: *meta.level(),
            buffer: Vec::new(),
        }
    }
}

/// Subscriber scoped to one PAM call. `KAGAMI_PAM_LOG` overrides the
/// default `info` filter.
pub fn subscriber(logger: Arc<PamLogger>) -> impl Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(SyslogMakeWriter::new(logger))
        .with_ansi(false)
        .without_time()
        .with_level(false)
        .with_target(true)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn severity_maps_tracing_levels() {
        assert_eq!(severity(Level::ERROR), "ERROR");
        assert_eq!(severity(Level::WARN), "WARN");
        assert_eq!(severity(Level::INFO), "INFO");
        assert_eq!(severity(Level::DEBUG), "DEBUG");
        assert_eq!(severity(Level::TRACE), "DEBUG");
    }

    #[test]
    fn buffered_lines_split_and_drop_blanks() {
        assert_eq!(
            buffered_lines(b"kagami::arbiter: race started\n\nsecond  \n"),
            vec!["kagami::arbiter: race started".to_string(), "second".into()]
        );
    }

    #[test]
    fn writer_accepts_partial_writes() {
        let logger = Arc::new(PamLogger::new("test-service"));
        let make = SyslogMakeWriter::new(logger);
        let mut writer = make.make_writer();
        writer.write_all(b"part one ").unwrap();
        writer.write_all(b"part two\n").unwrap();
        assert_eq!(buffered_lines(&writer.buffer), vec!["part one part two"]);
    }
}
