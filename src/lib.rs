pub mod admin;
pub mod auth;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod error;
pub mod logger;
pub mod pricing;
pub mod proxy;
pub mod selector;
pub mod sentinel;
pub mod server;

/// Installs a panic hook that logs through the structured logger before the
/// default handler runs, then brings up persistence and logging and starts
/// serving.
pub async fn run() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        crate::logger::error("panic", &format!("panic: message='{message}', location='{location}'"));
        eprintln!("FATAL PANIC: {message} at {location}");
    }));

    crate::db::init();
    crate::logger::init();
    let settings = crate::config::load();
    let level = crate::logger::LogLevel::from_str(&settings.log_level).unwrap_or(crate::logger::LogLevel::Info);
    crate::logger::set_min_level(level);
    crate::logger::info("app", "gateway starting up");
    crate::server::serve().await;
}
