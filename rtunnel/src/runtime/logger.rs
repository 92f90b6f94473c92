use std::path::PathBuf;
use std::str::FromStr;

use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::Append;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

pub const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {level} [{thread}] {target} - {m}{n}";
pub const LOG_FILE_NAME: &str = "engine.log";

const ROLL_SIZE: u64 = 50 * 1024 * 1024;
const ROLL_COUNT: u32 = 20;

#[derive(Clone, Debug, PartialEq)]
pub enum LogMode {
    /// local cluster, everything to stdout
    Console,
    /// `engine.log` in the directory, rolled by size
    RollingFile(PathBuf),
}

/// Install log4rs as the `log` backend.
/// level value: ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"], ignore ascii case
///
/// A second call leaves the installed logger alone and returns an error.
pub fn init_log(mode: &LogMode, level: &str) -> anyhow::Result<()> {
    let default_level = LevelFilter::from_str(level)
        .map_err(|_| anyhow!("can not parse log level `{}`", level))?;

    let encoder = PatternEncoder::new(LOG_PATTERN);
    let (name, appender) = match mode {
        LogMode::Console => ("console", create_console_appender(encoder)),
        LogMode::RollingFile(dir) => ("rolling_file", create_rolling_file_appender(dir, encoder)?),
    };

    let config = Config::builder()
        .appender(Appender::builder().build(name, appender))
        .build(Root::builder().appender(name).build(default_level))?;

    log4rs::init_config(config)?;
    Ok(())
}

fn create_console_appender(encoder: PatternEncoder) -> Box<dyn Append> {
    let stdout = ConsoleAppender::builder()
        .target(Target::Stdout)
        .encoder(Box::new(encoder))
        .build();
    Box::new(stdout)
}

fn create_rolling_file_appender(
    dir: &PathBuf,
    encoder: PatternEncoder,
) -> anyhow::Result<Box<dyn Append>> {
    let path = dir.join(LOG_FILE_NAME);
    let roll_path = format!("{}.{{}}", path.to_string_lossy());

    let trigger = SizeTrigger::new(ROLL_SIZE);
    let roll = FixedWindowRoller::builder()
        .base(1)
        .build(roll_path.as_str(), ROLL_COUNT)?;
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roll));

    let rolling_file = RollingFileAppender::builder()
        .encoder(Box::new(encoder))
        .append(true)
        .build(path, Box::new(policy))?;
    Ok(Box::new(rolling_file))
}

#[cfg(test)]
mod tests {
    use crate::runtime::logger::{init_log, LogMode};

    #[test]
    pub fn bad_level_test() {
        assert!(init_log(&LogMode::Console, "LOUD").is_err());
    }
}
