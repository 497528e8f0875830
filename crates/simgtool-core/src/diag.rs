//! Sink for verbose decode diagnostics.
//!
//! Diagnostics describe why an input was rejected or what was skipped. They
//! never change the outcome of an operation.

/// Receives one formatted diagnostic line at a time.
pub trait Diagnostics {
    /// Records a single line of diagnostic text.
    fn emit(&self, message: &str);
}

/// Forwards diagnostics to `tracing` as warnings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn emit(&self, message: &str) {
        tracing::warn!(target: "simgtool::diag", "{}", message);
    }
}

/// Discards all diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl Diagnostics for Silent {
    fn emit(&self, _message: &str) {}
}

impl<F: Fn(&str)> Diagnostics for F {
    fn emit(&self, message: &str) {
        self(message)
    }
}
