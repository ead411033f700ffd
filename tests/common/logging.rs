use {
    flexi_logger::{DeferredNow, Logger, LoggerHandle},
    std::sync::OnceLock,
    textwrap::{termwidth, Options},
};

static LOGGER: OnceLock<LoggerHandle> = OnceLock::new();

/// Install the test logger once per test binary.
///
/// The level comes from RUST_LOG and defaults to trace.
pub fn setup_logger() {
    LOGGER.get_or_init(|| {
        Logger::try_with_env_or_str("trace")
            .unwrap()
            .format(multiline_format)
            .start()
            .unwrap()
    });
}

/// Wrap long and multi-line messages under an indented header line.
fn multiline_format(
    w: &mut dyn std::io::Write,
    _now: &mut DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    let width = termwidth().max(40);
    let message = format!("{}", record.args());
    let wrapped = textwrap::fill(
        &message,
        Options::new(width - 4)
            .initial_indent("  ")
            .subsequent_indent("  "),
    );
    write!(
        w,
        "[{}] {}:{}\n{}\n",
        record.level(),
        record.module_path().unwrap_or("<unnamed>"),
        record.line().unwrap_or(0),
        wrapped,
    )
}
