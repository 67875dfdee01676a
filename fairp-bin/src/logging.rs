use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

use crate::verbosity::Verbosity;

/// Initialize the logging system with the given verbosity level.
pub(crate) fn init_logging(verbose: &Verbosity) {
    // RUST_LOG, when set, replaces all of the filters below.
    let env = Env::default().filter_or("RUST_LOG", "warn");

    let mut builder = Builder::from_env(env);
    builder.format_module_path(false).format_target(false);

    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(LevelFilter::Info);

        // `-v` and `-q` only affect our own crates
        let level_filter = verbose.log_level_filter();
        builder
            .filter_module("fairp", level_filter)
            .filter_module("fairp_lib", level_filter);
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {}",
            buf.timestamp_millis(),
            record.level(),
            record.args()
        )
    });

    builder.init();
}
