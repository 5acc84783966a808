use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

/// Log sink that masks provider keys and bot tokens before they reach stderr.
pub struct RedactingWriter<W> {
    inner: W,
}

impl RedactingWriter<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self {
            inner: std::io::stderr(),
        }
    }
}

impl<W: std::io::Write> std::io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        self.inner.write_all(redact_secrets(&line).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for RedactingWriter<std::io::Stderr> {
    type Writer = RedactingWriter<std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::stderr()
    }
}

static SECRET_PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
          sk-ant-[A-Za-z0-9_\-]{10,}      # Anthropic keys
        | sk-[A-Za-z0-9_\-]{20,}          # OpenAI-style keys
        | tvly-[A-Za-z0-9_\-]{10,}        # Tavily keys
        | gsk_[A-Za-z0-9]{20,}            # Groq keys
        | \d{6,12}:[A-Za-z0-9_\-]{30,}    # Telegram bot tokens
        ",
    )
    .expect("redaction regex should compile")
});

/// Replace known credential shapes with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    SECRET_PATTERNS.replace_all(input, "[REDACTED]").into_owned()
}
