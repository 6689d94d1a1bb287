use std::io::Write;

/// Maps the `-v` count onto an `env_logger` filter for this crate.
pub fn filter_for(verbose: u8) -> &'static str {
    match verbose {
        0 => "keylock=warn",
        1 => "keylock=info",
        2 => "keylock=debug",
        _ => "keylock=trace",
    }
}

/// Initialize the logger with the specified verbosity level
///
/// # Arguments
/// * `verbose` - Verbosity level (0=warn, 1=info, 2=debug, 3+=trace)
///
/// `RUST_LOG` takes precedence over the verbosity flag. Records carry the
/// emitting thread's name.
pub fn setup_logger(verbose: u8) {
    let result =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter_for(verbose)))
            .format(|buf, record| {
                let thread = std::thread::current();
                let name = thread.name().unwrap_or("unnamed");
                writeln!(
                    buf,
                    "[{} {:<5} {name}] {}",
                    buf.timestamp_millis(),
                    record.level(),
                    record.args()
                )
            })
            .try_init();

    if let Err(err) = result {
        log::debug!("Logger already initialised: {err}");
    }
}
