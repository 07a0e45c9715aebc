//! Diagnostics plumbing: llama.cpp's log stream is folded into `tracing` so
//! hosts configure one subscriber for both.

/// Route the runtime's own logs into `tracing`. Call once at startup.
pub fn route_runtime_logs() {
    gg::send_logs_to_tracing(gg::LogOptions::default().with_logs_enabled(true));
}

/// Install a stderr subscriber honouring `RUST_LOG`, and route runtime logs
/// through it. Safe to call more than once; later calls keep the first
/// subscriber.
pub fn init() {
    route_runtime_logs();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
