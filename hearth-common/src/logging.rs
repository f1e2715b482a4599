//! Span-scoped event macros and the global subscriber
//!
//! Events are grouped into one span per direction: `incoming` for messages
//! handed to the delivery core, `outgoing` for pushes to connected clients
//! and `internal` for everything else. Passing `message = <&Message>` adds
//! its `message_id` and `thread_id` to the span, so every event about one
//! message can be filtered by id.

use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

const LEVEL_ENV: &str = "LOG_LEVEL";

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, message = $message:expr, $($msg:expr),*) => {{
        let message = &$message;
        let span = $crate::tracing::span!(
            $level,
            $span,
            message_id = %message.id,
            thread_id = %message.thread_id
        );
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};

    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Traffic leaving this process, e.g. a push to a connected client
#[macro_export]
macro_rules! outgoing {
    (message = $message:expr, level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", message = $message, $($msg),*)
    };

    (message = $message:expr, $($msg:expr),*) => {
        $crate::outgoing!(message = $message, level = TRACE, $($msg),*)
    };

    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

/// Traffic arriving at this process, e.g. a message handed over for sending
#[macro_export]
macro_rules! incoming {
    (message = $message:expr, level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", message = $message, $($msg),*)
    };

    (message = $message:expr, $($msg:expr),*) => {
        $crate::incoming!(message = $message, level = TRACE, $($msg),*)
    };

    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! internal {
    (message = $message:expr, level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", message = $message, $($msg),*)
    };

    (message = $message:expr, $($msg:expr),*) => {
        $crate::internal!(message = $message, level = TRACE, $($msg),*)
    };

    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

/// Level named by `value`, or `default` if it is unset or unparseable
fn level_from(value: Option<&str>, default: LevelFilter) -> LevelFilter {
    value.map_or(default, |level| {
        LevelFilter::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

/// Install the global subscriber.
///
/// The level comes from `LOG_LEVEL`, falling back to TRACE for debug builds
/// and INFO otherwise. Only events from `hearth*` targets are emitted.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    let level = level_from(std::env::var(LEVEL_ENV).ok().as_deref(), default);

    // A second init (tests, embedding applications) keeps the first subscriber
    let _ = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("hearth")
                })),
        )
        .try_init();
}
