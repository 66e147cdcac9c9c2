use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::{self, IsTerminal};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub enum VerbosityLevel {
    Silent = 0,    // Warnings and errors only
    Summary = 1,   // Phase progress and final counts (default)
    Detailed = 2,  // Per-company outcomes
    Debug = 3,     // Everything, including store and HTTP details
}

impl VerbosityLevel {
    pub fn from_verbose_count(count: u8) -> Self {
        match count {
            0 => VerbosityLevel::Summary,
            1 => VerbosityLevel::Detailed,
            2.. => VerbosityLevel::Debug,
        }
    }

    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub fn filter_directive(&self) -> &'static str {
        match self {
            VerbosityLevel::Silent => "warn",
            VerbosityLevel::Summary => "gfscreen=info,warn",
            VerbosityLevel::Detailed => "gfscreen=debug,info",
            VerbosityLevel::Debug => "debug",
        }
    }
}

fn env_filter(verbosity: VerbosityLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directive()))
}

/// Install the global tracing subscriber.
///
/// Logs go to stderr; with `log_file` they are appended to that file as well.
pub fn init(verbosity: VerbosityLevel, log_file: Option<&Path>) -> Result<()> {
    let filter = env_filter(verbosity);

    let result = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory: {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context(format!("Failed to open log file: {}", path.display()))?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(io::stderr.and(Mutex::new(file)))
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(io::stderr().is_terminal())
            .with_writer(io::stderr)
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already set; skipping re-initialization");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_verbose_count() {
        assert_eq!(VerbosityLevel::from_verbose_count(0), VerbosityLevel::Summary);
        assert_eq!(VerbosityLevel::from_verbose_count(1), VerbosityLevel::Detailed);
        assert_eq!(VerbosityLevel::from_verbose_count(2), VerbosityLevel::Debug);
        assert_eq!(VerbosityLevel::from_verbose_count(9), VerbosityLevel::Debug);
    }

    #[test]
    fn test_filter_directives_parse() {
        for level in [
            VerbosityLevel::Silent,
            VerbosityLevel::Summary,
            VerbosityLevel::Detailed,
            VerbosityLevel::Debug,
        ] {
            assert!(EnvFilter::try_new(level.filter_directive()).is_ok());
        }
    }

    #[test]
    fn test_init_with_log_file_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("gfscreen.log");
        init(VerbosityLevel::Summary, Some(&path)).unwrap();
        init(VerbosityLevel::Debug, None).unwrap();
        assert!(path.exists());
    }
}
