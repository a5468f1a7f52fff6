use clap::Parser;
use log::{error, info};
use cuff_link::{init_logging, run, Options};
use cuff_link::error::{AppRunError, ConfigError};

fn main() -> Result<(), AppRunError> {
    let options = Options::parse();
    init_logging(options.log_level());
    info!(concat!("cuff-link ", env!("CARGO_PKG_VERSION")));

    match run(options) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("cuff-link is already running; only one controller may use the radio");
            Ok(())
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
