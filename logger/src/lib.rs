/*
 * Copyright 2026 The quern project developers
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Logging substrate for the build core.
//!
//! Task bodies never touch process-global stdio. Everything they print goes
//! through a [`Logger`], which the evaluator scopes per group with a
//! `[k/N] label` prefix and fans out to per-target log files. Loggers
//! compose: `MultiLogger(console, file)` is the usual arrangement.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// A sink for build output.
///
/// `ticker` is transient progress (interactive terminals overwrite the
/// current line); `info`/`error` are durable lines; `debug` is gated on the
/// implementation's debug flag. The byte sinks exist so byte-oriented task
/// code can be pointed at a logger via [`out_stream`]/[`err_stream`].
pub trait Logger: Send + Sync {
    fn colored(&self) -> bool {
        false
    }
    fn info(&self, s: &str);
    fn error(&self, s: &str);
    fn ticker(&self, s: &str);
    fn debug(&self, s: &str);
    fn write_out(&self, buf: &[u8]);
    fn write_err(&self, buf: &[u8]);
    /// Reads from the logger's input. The default is end-of-input; only
    /// interactive loggers are attached to real stdin.
    fn read_in(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
    fn close(&self) {}
}

impl<'a, L: Logger + ?Sized> Logger for &'a L {
    fn colored(&self) -> bool {
        (**self).colored()
    }
    fn info(&self, s: &str) {
        (**self).info(s)
    }
    fn error(&self, s: &str) {
        (**self).error(s)
    }
    fn ticker(&self, s: &str) {
        (**self).ticker(s)
    }
    fn debug(&self, s: &str) {
        (**self).debug(s)
    }
    fn write_out(&self, buf: &[u8]) {
        (**self).write_out(buf)
    }
    fn write_err(&self, buf: &[u8]) {
        (**self).write_err(buf)
    }
    fn read_in(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_in(buf)
    }
    fn close(&self) {
        (**self).close()
    }
}

impl<L: Logger + ?Sized> Logger for Box<L> {
    fn colored(&self) -> bool {
        (**self).colored()
    }
    fn info(&self, s: &str) {
        (**self).info(s)
    }
    fn error(&self, s: &str) {
        (**self).error(s)
    }
    fn ticker(&self, s: &str) {
        (**self).ticker(s)
    }
    fn debug(&self, s: &str) {
        (**self).debug(s)
    }
    fn write_out(&self, buf: &[u8]) {
        (**self).write_out(buf)
    }
    fn write_err(&self, buf: &[u8]) {
        (**self).write_err(buf)
    }
    fn read_in(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_in(buf)
    }
    fn close(&self) {
        (**self).close()
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct DummyLogger;

impl Logger for DummyLogger {
    fn info(&self, _s: &str) {}
    fn error(&self, _s: &str) {}
    fn ticker(&self, _s: &str) {}
    fn debug(&self, _s: &str) {}
    fn write_out(&self, _buf: &[u8]) {}
    fn write_err(&self, _buf: &[u8]) {}
}

/// Interactive terminal logger.
///
/// On a real terminal, tickers overwrite the current line; otherwise they
/// degrade to plain lines so piped output stays readable.
pub struct ConsoleLogger {
    colored: bool,
    debug_enabled: bool,
    out: Mutex<console::Term>,
    err: Mutex<console::Term>,
}

impl ConsoleLogger {
    pub fn new(colored: bool, debug_enabled: bool) -> ConsoleLogger {
        ConsoleLogger {
            colored,
            debug_enabled,
            out: Mutex::new(console::Term::stdout()),
            err: Mutex::new(console::Term::stderr()),
        }
    }

    fn with_out<F: FnOnce(&console::Term)>(&self, f: F) {
        if let Ok(term) = self.out.lock() {
            f(&term);
        }
    }

    fn with_err<F: FnOnce(&console::Term)>(&self, f: F) {
        if let Ok(term) = self.err.lock() {
            f(&term);
        }
    }
}

impl Logger for ConsoleLogger {
    fn colored(&self) -> bool {
        self.colored
    }

    fn info(&self, s: &str) {
        self.with_out(|term| {
            let _ = term.write_line(s);
        });
    }

    fn error(&self, s: &str) {
        let colored = self.colored;
        self.with_err(|term| {
            let line = if colored {
                format!("{}", console::style(s).red())
            } else {
                s.to_owned()
            };
            let _ = term.write_line(&line);
        });
    }

    fn ticker(&self, s: &str) {
        self.with_out(|term| {
            if term.is_term() {
                let _ = term.clear_line();
                let _ = write!(&mut &*term, "{}", s);
            } else {
                let _ = term.write_line(s);
            }
        });
    }

    fn debug(&self, s: &str) {
        if self.debug_enabled {
            self.with_err(|term| {
                let _ = term.write_line(s);
            });
        }
    }

    fn write_out(&self, buf: &[u8]) {
        self.with_out(|term| {
            let _ = (&mut &*term).write_all(buf);
        });
    }

    fn write_err(&self, buf: &[u8]) {
        self.with_err(|term| {
            let _ = (&mut &*term).write_all(buf);
        });
    }

    fn read_in(&self, buf: &mut [u8]) -> io::Result<usize> {
        io::stdin().read(buf)
    }

    fn close(&self) {
        self.with_out(|term| {
            if term.is_term() {
                let _ = term.write_line("");
            }
        });
    }
}

/// Writes lines to a file, opening it on first use.
///
/// The parent directory is created as needed. A logger whose file cannot be
/// opened stays silent rather than failing the build.
pub struct FileLogger {
    colored: bool,
    path: PathBuf,
    debug_enabled: bool,
    append: bool,
    file: Mutex<Option<File>>,
}

impl FileLogger {
    pub fn new(colored: bool, path: PathBuf, debug_enabled: bool, append: bool) -> FileLogger {
        FileLogger {
            colored,
            path,
            debug_enabled,
            append,
            file: Mutex::new(None),
        }
    }

    fn with_file<F: FnOnce(&mut File)>(&self, f: F) {
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let opened = OpenOptions::new()
                .create(true)
                .write(true)
                .append(self.append)
                .truncate(!self.append)
                .open(&self.path);
            match opened {
                Ok(file) => *guard = Some(file),
                Err(_) => return,
            }
        }
        if let Some(file) = guard.as_mut() {
            f(file);
        }
    }
}

impl Logger for FileLogger {
    fn colored(&self) -> bool {
        self.colored
    }

    fn info(&self, s: &str) {
        self.with_file(|f| {
            let _ = writeln!(f, "{}", s);
        });
    }

    fn error(&self, s: &str) {
        self.with_file(|f| {
            let _ = writeln!(f, "{}", s);
        });
    }

    fn ticker(&self, s: &str) {
        self.with_file(|f| {
            let _ = writeln!(f, "{}", s);
        });
    }

    fn debug(&self, s: &str) {
        if self.debug_enabled {
            self.with_file(|f| {
                let _ = writeln!(f, "{}", s);
            });
        }
    }

    fn write_out(&self, buf: &[u8]) {
        self.with_file(|f| {
            let _ = f.write_all(buf);
        });
    }

    fn write_err(&self, buf: &[u8]) {
        self.with_file(|f| {
            let _ = f.write_all(buf);
        });
    }

    fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(mut file) = guard.take() {
                let _ = file.flush();
            }
        }
    }
}

/// Fans every call out to two loggers.
pub struct MultiLogger<A: Logger, B: Logger> {
    colored: bool,
    a: A,
    b: B,
}

impl<A: Logger, B: Logger> MultiLogger<A, B> {
    pub fn new(colored: bool, a: A, b: B) -> MultiLogger<A, B> {
        MultiLogger { colored, a, b }
    }
}

impl<A: Logger, B: Logger> Logger for MultiLogger<A, B> {
    fn colored(&self) -> bool {
        self.colored
    }

    fn read_in(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.a.read_in(buf)
    }

    fn info(&self, s: &str) {
        self.a.info(s);
        self.b.info(s);
    }

    fn error(&self, s: &str) {
        self.a.error(s);
        self.b.error(s);
    }

    fn ticker(&self, s: &str) {
        self.a.ticker(s);
        self.b.ticker(s);
    }

    fn debug(&self, s: &str) {
        self.a.debug(s);
        self.b.debug(s);
    }

    fn write_out(&self, buf: &[u8]) {
        self.a.write_out(buf);
        self.b.write_out(buf);
    }

    fn write_err(&self, buf: &[u8]) {
        self.a.write_err(buf);
        self.b.write_err(buf);
    }

    fn close(&self) {
        self.a.close();
        self.b.close();
    }
}

/// Prepends a context string to every line-oriented call.
///
/// The evaluator uses this to scope task output as `[3/17] app.compile …`.
pub struct PrefixLogger<L: Logger> {
    inner: L,
    prefix: String,
}

impl<L: Logger> PrefixLogger<L> {
    pub fn new(inner: L, prefix: String) -> PrefixLogger<L> {
        PrefixLogger { inner, prefix }
    }
}

impl<L: Logger> Logger for PrefixLogger<L> {
    fn colored(&self) -> bool {
        self.inner.colored()
    }

    fn read_in(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_in(buf)
    }

    fn info(&self, s: &str) {
        self.inner.info(&format!("{}{}", self.prefix, s));
    }

    fn error(&self, s: &str) {
        self.inner.error(&format!("{}{}", self.prefix, s));
    }

    fn ticker(&self, s: &str) {
        self.inner.ticker(&format!("{}{}", self.prefix, s));
    }

    fn debug(&self, s: &str) {
        self.inner.debug(&format!("{}{}", self.prefix, s));
    }

    fn write_out(&self, buf: &[u8]) {
        self.inner.write_out(buf);
    }

    fn write_err(&self, buf: &[u8]) {
        self.inner.write_err(buf);
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// Forwards to an inner logger, optionally intercepting tickers.
pub struct ProxyLogger<L: Logger> {
    inner: L,
    on_ticker: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl<L: Logger> ProxyLogger<L> {
    pub fn new(inner: L) -> ProxyLogger<L> {
        ProxyLogger {
            inner,
            on_ticker: None,
        }
    }

    pub fn with_ticker<F: Fn(&str) + Send + Sync + 'static>(inner: L, f: F) -> ProxyLogger<L> {
        ProxyLogger {
            inner,
            on_ticker: Some(Box::new(f)),
        }
    }
}

impl<L: Logger> Logger for ProxyLogger<L> {
    fn colored(&self) -> bool {
        self.inner.colored()
    }

    fn read_in(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_in(buf)
    }

    fn info(&self, s: &str) {
        self.inner.info(s);
    }

    fn error(&self, s: &str) {
        self.inner.error(s);
    }

    fn ticker(&self, s: &str) {
        match &self.on_ticker {
            Some(f) => f(s),
            None => self.inner.ticker(s),
        }
    }

    fn debug(&self, s: &str) {
        self.inner.debug(s);
    }

    fn write_out(&self, buf: &[u8]) {
        self.inner.write_out(buf);
    }

    fn write_err(&self, buf: &[u8]) {
        self.inner.write_err(buf);
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// `io::Write` over a logger's stdout sink.
pub fn out_stream<'a>(logger: &'a dyn Logger) -> impl Write + 'a {
    LoggerStream {
        logger,
        err: false,
    }
}

/// `io::Write` over a logger's stderr sink.
pub fn err_stream<'a>(logger: &'a dyn Logger) -> impl Write + 'a {
    LoggerStream { logger, err: true }
}

/// `io::Read` over a logger's input.
pub fn in_stream<'a>(logger: &'a dyn Logger) -> impl Read + 'a {
    LoggerReader { logger }
}

struct LoggerReader<'a> {
    logger: &'a dyn Logger,
}

impl<'a> Read for LoggerReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.logger.read_in(buf)
    }
}

struct LoggerStream<'a> {
    logger: &'a dyn Logger,
    err: bool,
}

impl<'a> Write for LoggerStream<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.err {
            self.logger.write_err(buf);
        } else {
            self.logger.write_out(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
