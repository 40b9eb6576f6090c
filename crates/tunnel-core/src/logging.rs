use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_IDX: i32 = 2; // 0=error,1=warn,2=info,3=debug,4=trace

const LEVELS: [LevelFilter; 5] = [
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins over `initial` when set. Returns false when a subscriber
/// was already installed.
pub fn init_tracing(initial: LevelFilter) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_to_str(initial)));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .is_ok()
}

/// Level selected by repeated `-v` / `-q` flags, starting from info.
pub fn level_from_verbosity(verbose: u8, quiet: u8) -> LevelFilter {
    let idx = (DEFAULT_IDX + i32::from(verbose) - i32::from(quiet)).clamp(0, 4);
    LEVELS[idx as usize]
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::INFO => "info",
        LevelFilter::DEBUG => "debug",
        LevelFilter::TRACE => "trace",
        LevelFilter::OFF => "off",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_flags_move_from_info() {
        assert_eq!(level_from_verbosity(0, 0), LevelFilter::INFO);
        assert_eq!(level_from_verbosity(1, 0), LevelFilter::DEBUG);
        assert_eq!(level_from_verbosity(5, 0), LevelFilter::TRACE);
        assert_eq!(level_from_verbosity(0, 1), LevelFilter::WARN);
        assert_eq!(level_from_verbosity(0, 9), LevelFilter::ERROR);
        assert_eq!(level_from_verbosity(2, 1), LevelFilter::DEBUG);
    }

    #[test]
    fn levels_map_to_filter_directives() {
        for level in LEVELS {
            let directive = level_to_str(level);
            assert_eq!(directive.parse::<LevelFilter>().ok(), Some(level));
            assert!(EnvFilter::try_new(directive).is_ok());
        }
    }

    #[test]
    fn subscriber_is_installed_once() {
        assert!(init_tracing(LevelFilter::INFO));
        assert!(!init_tracing(LevelFilter::DEBUG));
    }
}
