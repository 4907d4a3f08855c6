/*!
Command line configuration.

```
# use vadd_offload::config::{Config, MismatchPolicy};
let config = Config::from_args(["vadd-offload", "vadd.xclbin", "--elements", "8"]).unwrap();
assert_eq!(config.elements, 8);
assert_eq!(config.mismatch_policy(), MismatchPolicy::Report);
```
*/

use clap::{ArgAction, Parser};
use std::{ffi::OsString, path::PathBuf};
use tracing::level_filters::LevelFilter;

/// The default number of elements, 6 Mi.
pub const DEFAULT_ELEMENTS: usize = 6 * 1024 * 1024;

/// Set to any value to select the emulated device.
pub const EMULATION_MODE_ENV: &str = "XCL_EMULATION_MODE";

/// Errors.
pub mod error {
    /// The arguments could not be parsed.
    ///
    /// Displays the rendered usage message.
    #[derive(Debug, thiserror::Error)]
    #[error("{usage}")]
    pub struct UsageError {
        pub(super) usage: String,
        pub(super) informational: bool,
    }

    impl UsageError {
        /// The usage message.
        pub fn usage(&self) -> &str {
            &self.usage
        }
        /// Whether help or version was requested rather than an error made.
        pub fn is_informational(&self) -> bool {
            self.informational
        }
    }
}
use error::UsageError;

/// What a result mismatch does to the exit status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Report the mismatch and exit with success.
    #[default]
    Report,
    /// Report the mismatch and exit with failure.
    Fail,
}

/// Runs `c = a + b` on an accelerator and checks it against the host.
#[derive(Parser, Clone, Debug)]
#[command(name = "vadd-offload", version, about)]
pub struct Config {
    /// The kernel image.
    #[arg(value_name = "XCLBIN")]
    pub xclbin: PathBuf,
    /// The number of elements.
    #[arg(
        long,
        env = "VADD_ELEMENTS",
        default_value_t = DEFAULT_ELEMENTS,
        value_parser = parse_elements,
    )]
    pub elements: usize,
    /// Use the emulated device, also selected by XCL_EMULATION_MODE.
    #[arg(long)]
    pub emulate: bool,
    /// Exit with failure if the results do not match.
    #[arg(long, env = "VADD_FAIL_ON_MISMATCH")]
    pub fail_on_mismatch: bool,
    /// Log more, repeat for more detail.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

fn parse_elements(s: &str) -> Result<usize, String> {
    let elements: u64 = s.parse().map_err(|e| format!("{e}"))?;
    if elements == 0 {
        return Err("must be at least 1".to_string());
    }
    if elements > u32::MAX as u64 {
        return Err(format!("must be at most {}", u32::MAX));
    }
    usize::try_from(elements).map_err(|e| format!("{e}"))
}

impl Config {
    /// A config for `xclbin` with default options.
    pub fn new(xclbin: impl Into<PathBuf>) -> Self {
        Self {
            xclbin: xclbin.into(),
            elements: DEFAULT_ELEMENTS,
            emulate: false,
            fail_on_mismatch: false,
            verbose: 0,
        }
    }
    /** Parses the arguments, including the program name.

    **errors**
    - [`UsageError`] if the arguments are invalid, or help or version is requested.
    */
    pub fn from_args<I, T>(args: I) -> Result<Self, UsageError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(args).map_err(|e| {
            use clap::error::ErrorKind::*;
            UsageError {
                usage: e.render().to_string(),
                informational: matches!(e.kind(), DisplayHelp | DisplayVersion),
            }
        })
    }
    /// Whether to use the emulated device.
    pub fn emulation(&self) -> bool {
        self.emulate || std::env::var_os(EMULATION_MODE_ENV).is_some()
    }
    /// The mismatch policy.
    pub fn mismatch_policy(&self) -> MismatchPolicy {
        if self.fail_on_mismatch {
            MismatchPolicy::Fail
        } else {
            MismatchPolicy::Report
        }
    }
    /// The default log level, overridden by `RUST_LOG`.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}
