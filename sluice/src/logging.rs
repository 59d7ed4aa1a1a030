pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use serdeconv;
use sloggers::{Config, LoggerConfig};

/// Builds the root terminal logger. All components receive children of this
/// logger; leaf types accept `Option<&Logger>` and fall back to `Discard`
/// so tests stay quiet.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Resolves an optional parent logger into a concrete instance, discarding
/// output when no parent is supplied.
#[inline]
pub fn child_or_discard<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        _ => Logger::root(Discard, o!()),
    }
}
