//! Emulator feature detection.
//!
//! Runs `<executable> --help` with a hard timeout and inspects the usage
//! text for optional facets. Any failure, including a timeout or a
//! non-zero exit, means "not supported"; it never aborts a start.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::process::{LaunchSpec, ProcessLauncher};

/// Usage-text marker advertising table storage support.
const TABLE_FLAG: &str = "--tableHost";

/// Optional capabilities of an emulator build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmulatorFeatures {
    /// Table storage endpoint (`--tableHost`/`--tablePort`).
    pub table: bool,
}

impl EmulatorFeatures {
    /// Features advertised by a `--help` usage text.
    #[must_use]
    pub fn from_help_text(text: &str) -> Self {
        Self {
            table: text.contains(TABLE_FLAG),
        }
    }
}

/// Detect the optional features of the emulator at `executable`.
pub async fn probe_features(
    launcher: &dyn ProcessLauncher,
    executable: &Path,
    timeout: Duration,
) -> EmulatorFeatures {
    let spec = LaunchSpec::command(executable, &["--help"]);

    let output = match launcher.run_captured(&spec, timeout).await {
        Ok(output) => output,
        Err(err) => {
            warn!(executable = %executable.display(), %err, "feature probe failed, assuming no optional features");
            return EmulatorFeatures::default();
        }
    };

    if !output.success {
        warn!(
            executable = %executable.display(),
            code = ?output.code,
            "feature probe exited unsuccessfully, assuming no optional features"
        );
        return EmulatorFeatures::default();
    }

    debug!(bytes = output.stdout.len(), "feature probe output captured");
    let features = EmulatorFeatures::from_help_text(&output.stdout);
    info!(table = features.table, "emulator features detected");
    features
}
