pub mod allowlist;
pub mod redaction;

pub use allowlist::{AccessDecision, Allowlist};
pub use redaction::{RedactingWriter, redact_secrets};
