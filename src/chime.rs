//! Audible cue played when something new arrives. Always best-effort.

use std::io::Write;
use std::sync::Arc;
use tracing::debug;

pub trait Chime: Send + Sync {
    /// Play the cue. Must not panic or block for long; failures are swallowed.
    fn play(&self);
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalBell;

impl Chime for TerminalBell {
    fn play(&self) {
        let mut stderr = std::io::stderr().lock();
        if let Err(err) = stderr.write_all(b"\x07").and_then(|_| stderr.flush()) {
            debug!(?err, "could not ring terminal bell");
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SilentChime;

impl Chime for SilentChime {
    fn play(&self) {}
}

/// Pick the cue for a config flag.
pub fn from_flag(enabled: bool) -> Arc<dyn Chime> {
    if enabled {
        Arc::new(TerminalBell)
    } else {
        Arc::new(SilentChime)
    }
}
