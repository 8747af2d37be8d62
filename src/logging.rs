use std::path::Path;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Route all logging to stderr, plus `log_file` when given.
///
/// Stdout carries protocol frames only, so nothing may log there.
pub fn setup_logging(level: LevelFilter, log_file: Option<&Path>) -> anyhow::Result<()> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let mut config = Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(path)?;
        config = config.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }

    log4rs::init_config(config.build(root.build(level))?)?;
    Ok(())
}
