use std::fmt::Arguments;
use std::io;
use std::sync::Arc;
use tracing::Level;

/// A minimal leveled logger.
///
/// Code that must not depend on `tracing` takes one of these; the embedding
/// application decides where the output goes.
pub trait Logger: Send + Sync {
    /// Logs a debug message.
    fn debug(&self, args: Arguments<'_>);

    /// Logs an informational message.
    fn info(&self, args: Arguments<'_>);

    /// Logs a warning.
    fn warn(&self, args: Arguments<'_>);

    /// Logs an error.
    fn error(&self, args: Arguments<'_>);

    /// Logs at the given level.
    fn log(&self, level: Level, args: Arguments<'_>) {
        match level {
            Level::ERROR => self.error(args),
            Level::WARN => self.warn(args),
            Level::INFO => self.info(args),
            _ => self.debug(args),
        }
    }
}

impl<L> Logger for Arc<L>
where
    L: Logger + ?Sized,
{
    fn debug(&self, args: Arguments<'_>) {
        (**self).debug(args)
    }

    fn info(&self, args: Arguments<'_>) {
        (**self).info(args)
    }

    fn warn(&self, args: Arguments<'_>) {
        (**self).warn(args)
    }

    fn error(&self, args: Arguments<'_>) {
        (**self).error(args)
    }
}

impl<L> Logger for &L
where
    L: Logger + ?Sized,
{
    fn debug(&self, args: Arguments<'_>) {
        (**self).debug(args)
    }

    fn info(&self, args: Arguments<'_>) {
        (**self).info(args)
    }

    fn warn(&self, args: Arguments<'_>) {
        (**self).warn(args)
    }

    fn error(&self, args: Arguments<'_>) {
        (**self).error(args)
    }
}

/// The default [`Logger`]: forwards every message to `tracing`, tagged with
/// the name of its source.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    source: Arc<str>,
}

impl TracingLogger {
    /// Creates a logger that tags its events with the given source.
    pub fn new(source: impl AsRef<str>) -> Self {
        Self {
            source: Arc::from(source.as_ref()),
        }
    }

    /// The source tag.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new("herald")
    }
}

impl Logger for TracingLogger {
    fn debug(&self, args: Arguments<'_>) {
        tracing::debug!(source = %self.source, "{}", args);
    }

    fn info(&self, args: Arguments<'_>) {
        tracing::info!(source = %self.source, "{}", args);
    }

    fn warn(&self, args: Arguments<'_>) {
        tracing::warn!(source = %self.source, "{}", args);
    }

    fn error(&self, args: Arguments<'_>) {
        tracing::error!(source = %self.source, "{}", args);
    }
}

/// Splits a leading `[LEVEL]` tag off the given line.
///
/// Recognizes `[DEBUG]`, `[INFO]`, `[WARN]`, `[WARNING]` and `[ERROR]`, case
/// insensitively. Untagged lines are informational. The remainder is trimmed.
pub fn split_level_prefix(line: &str) -> (Level, &str) {
    let trimmed = line.trim_start();

    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some((tag, rest)) = rest.split_once(']') {
            let level = match tag.to_ascii_uppercase().as_str() {
                "DEBUG" => Some(Level::DEBUG),
                "INFO" => Some(Level::INFO),
                "WARN" | "WARNING" => Some(Level::WARN),
                "ERROR" => Some(Level::ERROR),
                _ => None,
            };

            if let Some(level) = level {
                return (level, rest.trim());
            }
        }
    }

    (Level::INFO, line.trim())
}

/// Adapts a line-oriented, prefix-tagged text stream onto a [`Logger`].
///
/// Third-party libraries that only know how to write lines like
/// `[WARN] heartbeat missed` into some writer can be handed this adapter: each
/// complete line is routed to the matching [`Logger`] level. A trailing
/// partial line is held back until the next write or [flush](io::Write::flush).
#[derive(Debug)]
pub struct PrefixAdapter<L> {
    logger: L,
    buffer: Vec<u8>,
}

impl<L> PrefixAdapter<L>
where
    L: Logger,
{
    /// Wraps the given logger.
    pub fn new(logger: L) -> Self {
        Self {
            logger,
            buffer: Vec::new(),
        }
    }

    /// Routes a single line to the wrapped logger. Blank lines are skipped.
    pub fn log_line(&self, line: &str) {
        let (level, message) = split_level_prefix(line);

        if message.is_empty() {
            return;
        }

        self.logger.log(level, format_args!("{}", message));
    }

    /// Exposes the wrapped logger.
    pub fn logger(&self) -> &L {
        &self.logger
    }

    fn drain_lines(&mut self) {
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=position).collect();
            self.log_line(&String::from_utf8_lossy(&line));
        }
    }
}

impl<L> io::Write for PrefixAdapter<L>
where
    L: Logger,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.drain_lines();

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.log_line(&String::from_utf8_lossy(&rest));
        }

        Ok(())
    }
}
