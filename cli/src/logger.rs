use anyhow::Result;
use log::{Level, LevelFilter, Metadata, Record};

struct StackLogger;

impl log::Log for StackLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            match record.level() {
                Level::Error => {
                    eprint!("{} ", ::console::style("Error:").red().bold());
                }
                Level::Warn => {
                    eprint!("{} ", ::console::style("Warning:").yellow().bold());
                }
                Level::Info => {
                    eprint!("{} ", ::console::style("Info:").cyan().bold());
                }
                Level::Debug | Level::Trace => return,
            }
            eprintln!("{}", record.args());
        }
    }

    fn flush(&self) {}
}

pub fn init() -> Result<()> {
    log::set_boxed_logger(Box::new(StackLogger)).map(|()| log::set_max_level(LevelFilter::Info))?;
    Ok(())
}
