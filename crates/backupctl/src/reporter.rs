//! User-facing output.
//!
//! Commands write through a [`Reporter`] handed to them instead of printing
//! directly, so tests can capture what a user would see. Diagnostics for
//! operators go through `tracing` on stderr instead.

use std::io::{self, BufRead, Write};
#[cfg(test)]
use std::sync::{Arc, Mutex};

/// Output and prompt sink for one command.
pub struct Reporter {
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
    input: Box<dyn BufRead + Send>,
}

impl Reporter {
    /// The process's stdout, stderr and stdin.
    pub fn stdio() -> Self {
        Self::new(
            Box::new(io::stdout()),
            Box::new(io::stderr()),
            Box::new(io::BufReader::new(io::stdin())),
        )
    }

    pub fn new(
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
        input: Box<dyn BufRead + Send>,
    ) -> Self {
        Self { out, err, input }
    }

    /// Normal progress and results.
    pub fn info(&mut self, message: impl AsRef<str>) {
        let _ = writeln!(self.out, "{}", message.as_ref());
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        let _ = writeln!(self.err, "warning: {}", message.as_ref());
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        let _ = writeln!(self.err, "error: {}", message.as_ref());
    }

    /// Ask a yes/no question. A blank answer means yes; end of input means no.
    pub fn confirm(&mut self, question: &str) -> io::Result<bool> {
        write!(self.out, "{} [Y/n] ", question)?;
        self.out.flush()?;

        let mut answer = String::new();
        if self.input.read_line(&mut answer)? == 0 {
            return Ok(false);
        }

        let answer = answer.trim();
        Ok(answer.is_empty() || answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
    }
}

/// A clonable in-memory writer.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("buffer lock poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Captured output of a [`Reporter`] built by [`Reporter::capture`].
#[cfg(test)]
#[derive(Clone, Default)]
pub struct Captured {
    pub out: SharedBuffer,
    pub err: SharedBuffer,
}

#[cfg(test)]
impl Reporter {
    /// A reporter writing to memory, answering prompts from `input`.
    pub fn capture(input: &str) -> (Self, Captured) {
        let captured = Captured::default();
        let reporter = Self::new(
            Box::new(captured.out.clone()),
            Box::new(captured.err.clone()),
            Box::new(io::Cursor::new(input.as_bytes().to_vec())),
        );
        (reporter, captured)
    }
}
