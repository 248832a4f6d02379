use chrono::Local;
use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

/// Crates that are chatty at debug level while parsing pages or pooling connections.
const NOISY: [&str; 4] = ["html5ever", "selectors", "hyper_util", "reqwest::connect"];

/// `info` by default, `RUST_LOG` overrides it.
pub fn init() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    for module in NOISY {
        builder.filter_module(module, LevelFilter::Warn);
    }
    let installed = builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .try_init();

    if installed.is_ok() {
        log::info!("Logger initialized.");
    }
}
