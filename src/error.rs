use std::io;

/// Failures surfaced while wiring up counters and output files.
///
/// Individual counter problems are logged and tolerated (see the component
/// modules); this type covers the construction paths where the caller has to
/// decide between falling back and giving up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A sysfs or procfs file could not be read.
    #[error("failed to read {path}")]
    Sysfs {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A sysfs file was readable but its contents did not have the expected
    /// shape.
    #[error("malformed value in {path}: {value:?}")]
    Parse { path: String, value: String },

    /// No counter could be opened on any PMU.
    #[error("no usable performance counter could be opened")]
    NoCounters,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn sysfs(path: &str, source: io::Error) -> Self {
        Error::Sysfs {
            path: path.to_string(),
            source,
        }
    }

    pub(crate) fn parse(path: &str, value: &str) -> Self {
        Error::Parse {
            path: path.to_string(),
            value: value.trim_end().to_string(),
        }
    }
}
