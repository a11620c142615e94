//! Observability helpers.

use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs a global tracing subscriber for embedding applications.
///
/// Respects `RUST_LOG`; defaults to `info` for rowflow targets. Calling
/// it twice is harmless - the second install is ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rowflow=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Wall-clock timer for stage and pipeline phases.
#[derive(Debug)]
pub struct PhaseTimer {
    start: Instant,
    name: String,
}

impl PhaseTimer {
    /// Starts timing a named phase.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the phase name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Finishes the phase, logging and returning its duration.
    pub fn finish(self) -> f64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!(phase = %self.name, elapsed_ms = elapsed, "phase finished");
        elapsed
    }
}
