//! The implementation of the `YKD_LOG*` environment variables.
//!
//! `YKD_LOG=[<path|->:]<level>` controls the colorizer's normal logging. `YKD_LOG_IR` is only
//! available when the `ykd` feature is enabled: otherwise [dump_ir] is a no-op.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

/// How verbose should the colorizer's normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log colorizer events (spills, reconciliations at scope exits).
    ColorizeEvent,
}

/// Where log output goes.
#[derive(Clone, Debug, PartialEq)]
enum Sink {
    Stderr,
    /// A file, which was truncated when the sink was parsed and is appended to thereafter.
    File(PathBuf),
}

impl Sink {
    /// Split an optional `<path|->:` prefix from `s`, returning the sink and the rest of `s`.
    fn split(s: &str) -> Result<(Self, &str), Box<dyn Error>> {
        match s.split(':').collect::<Vec<_>>()[..] {
            ["-", rest] => Ok((Sink::Stderr, rest)),
            [path, rest] => {
                let path = PathBuf::from(path);
                // Later writes append, so don't let them append to a previous run's output.
                File::create(&path).map_err(|e| format!("Can't create {}: {e}", path.display()))?;
                Ok((Sink::File(path), rest))
            }
            [rest] => Ok((Sink::Stderr, rest)),
            _ => Err(format!("Too many `:`s in '{s}'").into()),
        }
    }

    fn write(&self, s: &str) {
        match self {
            Sink::Stderr => eprint!("{s}"),
            Sink::File(p) => {
                File::options()
                    .append(true)
                    .open(p)
                    .and_then(|mut f| f.write_all(s.as_bytes()))
                    .ok();
            }
        }
    }
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    sink: Sink,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("YKD_LOG") {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self::errors_only()),
        }
    }

    /// Parse a `YKD_LOG` value.
    pub(crate) fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let (sink, level) = Sink::split(s)
            .map_err(|e| format!("YKD_LOG must be of the format `[<path|->:]<level>`: {e}"))?;
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid YKD_LOG level '{s}': {e}"))?;
        let level = Verbosity::from_repr(level).ok_or_else(|| {
            format!(
                "YKD_LOG level {level} exceeds maximum {}",
                Verbosity::COUNT - 1
            )
        })?;
        Ok(Self { level, sink })
    }

    /// A [Log] which reports only errors, to stderr.
    pub(crate) fn errors_only() -> Self {
        Self {
            level: Verbosity::Error,
            sink: Sink::Stderr,
        }
    }

    /// Will a message at `level` be written anywhere?
    pub(crate) fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `level`. Logging at [Verbosity::Disabled] writes
    /// nothing.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if !self.enabled(level) {
            return;
        }
        let prefix = match level {
            Verbosity::Disabled => return,
            Verbosity::Error => "ykcolor-error",
            Verbosity::Warning => "ykcolor-warning",
            Verbosity::ColorizeEvent => "ykcolor-event",
        };
        self.sink.write(&format!("{prefix}: {msg}\n"));
    }
}

/// The points at which `YKD_LOG_IR` can dump a procedure.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum IRPhase {
    /// The command list handed to the colorizer.
    ColorizeIn,
    /// The flat command list produced by the colorizer, before frame finalization.
    ColorizeOut,
    /// The finalized instruction listing.
    Asm,
}

#[cfg(feature = "ykd")]
mod internals {
    use super::{IRPhase, Sink};
    use std::{collections::HashSet, env, error::Error, str::FromStr, sync::LazyLock};

    /// Parse a `YKD_LOG_IR` value.
    pub(super) fn parse(s: &str) -> Result<(Sink, HashSet<IRPhase>), Box<dyn Error>> {
        let (sink, phases) = Sink::split(s).map_err(|e| {
            format!("YKD_LOG_IR must be of the format `[<path>:]<phase_1>[,...,<phase_n>]`: {e}")
        })?;
        let phases = phases
            .split(',')
            .map(|x| IRPhase::from_str(x).map_err(|_| format!("Invalid YKD_LOG_IR phase '{x}'")))
            .collect::<Result<HashSet<_>, _>>()?;
        Ok((sink, phases))
    }

    static LOG_IR: LazyLock<Option<(Sink, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let s = env::var("YKD_LOG_IR").ok()?;
        match parse(&s) {
            Ok(x) => Some(x),
            Err(e) => {
                eprintln!("ykcolor-error: {e}");
                None
            }
        }
    });

    pub(crate) fn dump_ir(phase: IRPhase, name: &str, body: impl FnOnce() -> String) {
        if let Some((sink, phases)) = LOG_IR.as_ref() {
            if phases.contains(&phase) {
                sink.write(&format!(
                    "--- Begin {phase}: {name} ---\n{}--- End {phase} ---\n",
                    body()
                ));
            }
        }
    }
}

#[cfg(not(feature = "ykd"))]
mod internals {
    use super::IRPhase;

    pub(crate) fn dump_ir(_: IRPhase, _: &str, _: impl FnOnce() -> String) {}
}

/// If `YKD_LOG_IR` asks for `phase`, write the listing produced by `body` for the procedure
/// `name`.
pub(crate) use internals::dump_ir;
