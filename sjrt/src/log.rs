//! Backend logging.
//!
//! `SJD_LOG=[<path>|-:]<level>` selects which backend events are reported, where `<level>` is
//! either a number or the lower-case name of a [Verbosity]. `SJD_LOG_ASM=<path>|-` dumps the
//! disassembly of every synthesised call stub.

use std::{
    env,
    error::Error,
    fmt,
    fs::File,
    io::Write,
    path::PathBuf,
    str::FromStr,
    sync::LazyLock,
};
use strum::{EnumCount, EnumString, FromRepr, IntoStaticStr};

/// Which backend events are worth reporting? Each level includes the ones before it.
#[repr(u8)]
#[derive(
    Copy, Clone, Debug, EnumCount, EnumString, FromRepr, IntoStaticStr, PartialEq, PartialOrd,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Verbosity {
    Disabled,
    /// A call stub couldn't be synthesised.
    Error,
    /// A signature couldn't be laid out, or a frame couldn't be built for it.
    Warning,
    /// A signature was classified for the first time.
    Layout,
    /// A call stub was synthesised.
    Stub,
}

/// Where log lines go.
#[derive(Debug, PartialEq)]
enum Sink {
    Stderr,
    /// Appended to. The file is emptied when the sink is created.
    File(PathBuf),
}

impl Sink {
    fn open(s: &str) -> Self {
        if s == "-" {
            return Sink::Stderr;
        }
        let path = PathBuf::from(s);
        File::create(&path).ok();
        Sink::File(path)
    }

    fn write_line(&self, line: fmt::Arguments) {
        match self {
            Sink::Stderr => eprintln!("{line}"),
            Sink::File(p) => {
                File::options()
                    .append(true)
                    .open(p)
                    .and_then(|mut f| writeln!(f, "{line}"))
                    .ok();
            }
        }
    }
}

#[derive(Debug)]
pub struct Log {
    level: Verbosity,
    sink: Sink,
}

impl Log {
    /// A logger configured from `SJD_LOG`. Without it, errors go to stderr.
    pub fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("SJD_LOG") {
            Ok(s) => s.parse(),
            Err(_) => Ok(Self {
                level: Verbosity::Error,
                sink: Sink::Stderr,
            }),
        }
    }

    /// A logger which never logs anything.
    pub fn disabled() -> Self {
        Self {
            level: Verbosity::Disabled,
            sink: Sink::Stderr,
        }
    }

    pub fn level(&self) -> Verbosity {
        self.level
    }

    /// Would a message at `level` be written?
    pub fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` at `level`, prefixed with the level's name.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub fn log(&self, level: Verbosity, msg: &str) {
        assert_ne!(level, Verbosity::Disabled, "Can't log at level `disabled`");
        if self.enabled(level) {
            let name: &'static str = level.into();
            self.sink.write_line(format_args!("sjrt-{name}: {msg}"));
        }
    }
}

impl FromStr for Log {
    type Err = Box<dyn Error>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sink, level) = match s.split_once(':') {
            Some((_, l)) if l.contains(':') => {
                return Err("SJD_LOG must be of the format `[<path|->:]<level>`".into())
            }
            Some((p, l)) => (Some(p), l),
            None => (None, s),
        };
        let level = match level.parse::<u8>() {
            Ok(n) => Verbosity::from_repr(n).ok_or_else(|| {
                format!(
                    "SJD_LOG level {n} exceeds maximum {}",
                    Verbosity::COUNT - 1
                )
            })?,
            Err(_) => Verbosity::from_str(level)
                .map_err(|_| format!("Invalid SJD_LOG level '{level}'"))?,
        };
        // Only touch the file once the level is known to be good.
        let sink = sink.map_or(Sink::Stderr, Sink::open);
        Ok(Self { level, sink })
    }
}

static LOG_ASM: LazyLock<Option<Sink>> =
    LazyLock::new(|| env::var("SJD_LOG_ASM").ok().map(|s| Sink::open(&s)));

pub(crate) fn should_log_asm() -> bool {
    LOG_ASM.is_some()
}

/// Write the disassembly `s` to wherever `SJD_LOG_ASM` points.
pub(crate) fn log_asm(s: &str) {
    if let Some(sink) = LOG_ASM.as_ref() {
        sink.write_line(format_args!("{s}"));
    }
}
