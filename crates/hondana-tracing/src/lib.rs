//! Tracing bootstrap shared by the CLI and tests.

use parking_lot::Once;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt::MakeWriter, util::SubscriberInitExt};

/// Which kind of process is consuming the tracing output.
#[derive(PartialEq, Eq)]
pub enum TracingConsumer {
    /// `cargo test` processes; verbose, captured by the harness.
    Test,
    /// The command-line tool; quiet by default.
    Tool,
}

/// Initializes tracing with stdout as the output. Safe to call more than
/// once; only the first call installs the subscriber.
pub fn init_tracing(consumer: TracingConsumer) {
    init_tracing_with_writer(consumer, std::io::stdout);
}

pub fn init_tracing_with_writer<W>(consumer: TracingConsumer, writer: W)
where
    W: for<'writer> MakeWriter<'writer> + 'static + Send + Sync,
{
    static INIT: Once = Once::new();
    INIT.call_once(move || {
        let testing = consumer == TracingConsumer::Test;
        let color = !std::env::var("NO_COLOR").is_ok_and(|s| !s.is_empty());

        let default_level = if testing {
            LevelFilter::DEBUG
        } else {
            LevelFilter::WARN
        };

        let mut filter = EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env()
            .expect("invalid RUST_LOG filter");

        if testing {
            filter = filter
                .add_directive("hondana_core=trace".parse().unwrap())
                .add_directive("hondana_kernel=trace".parse().unwrap());
        }

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_ansi(color)
            .with_writer(writer)
            .finish()
            .try_init()
            .expect("failed to setup tracing subscriber");
    });
}
