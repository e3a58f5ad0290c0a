use env_logger::{Builder, Env};
use std::io::Write;

/// Logs at `info` unless `RUST_LOG` says otherwise.
pub fn start_log() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{}: {}: {}: {}",
                buf.timestamp(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
