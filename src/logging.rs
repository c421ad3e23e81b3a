use std::io::Write;
use std::sync::Once;

use chrono::{SecondsFormat, Utc};
use log::Record;

use crate::config::{self, LogFormat};

static INIT: Once = Once::new();

/// Installs the global logger once. `RUST_LOG` filters (default `info`),
/// `LOG_FORMAT=json` switches to one JSON object per line. Later calls are
/// no-ops.
///
/// ```
/// sipnet::logging::init();
/// log::info!("logger initialized");
/// ```
pub fn init() {
    INIT.call_once(|| {
        let format = config::logging_config().format;
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .target(env_logger::Target::Stdout)
            .format(move |buf, record| writeln!(buf, "{}", render(format, record)))
            .try_init();
    });
}

fn render(format: LogFormat, record: &Record<'_>) -> String {
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    match format {
        LogFormat::Json => serde_json::json!({
            "ts": ts,
            "level": record.level().as_str(),
            "target": record.target(),
            "msg": record.args().to_string(),
        })
        .to_string(),
        LogFormat::Text => format!(
            "{} {:<5} {} {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        ),
    }
}
