use std::{io::Write, path::Path};

use anstyle::Style;
use env_logger::Env;

fn location(record: &log::Record) -> Option<String> {
    let style = Style::new().dimmed().italic();
    match (record.file(), record.line()) {
        (Some(file), Some(line)) if Path::new(file).is_relative() => {
            Some(format!(" {style}{file}:{line}{style:#}"))
        }
        _ => {
            let module = record.module_path()?;
            Some(format!(" {style}{module}{style:#}"))
        }
    }
}

/// Maps `-v` repetitions to a level; quiet runs still report session progress.
pub fn level_for(verbosity: u8) -> log::Level {
    match verbosity {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

/// `RUST_LOG` wins over `level`, which only applies to this crate.
pub fn init_logger(level: log::Level, line_numbers: bool) {
    env_logger::Builder::from_env(Env::default().filter_or("RUST_LOG", format!("warn,rxmv={level}")))
        .format(move |buf, record| {
            let style = buf.default_level_style(record.level());
            let location = if line_numbers {
                location(record).unwrap_or_default()
            } else {
                String::new()
            };
            writeln!(
                buf,
                "[{style}{}{style:#}{location}] {}",
                record.level(),
                record.args()
            )
        })
        .init();
}
