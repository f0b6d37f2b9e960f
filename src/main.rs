use ssh_broker::app::App;
use ssh_broker::services::logger::Logger;
use ssh_broker::services::singleton::SingletonGuard;
use ssh_broker::utils::paths::resolve_lockfile_path;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let logger = Logger::new("ssh-broker");

    let guard = match SingletonGuard::acquire(logger.clone(), resolve_lockfile_path()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("ssh-broker: {}", err.message);
            std::process::exit(1);
        }
    };

    let app = match App::initialize(logger.clone()) {
        Ok(app) => Arc::new(app),
        Err(err) => {
            guard.release();
            eprintln!("ssh-broker: {}", err.message);
            std::process::exit(1);
        }
    };

    let result = tokio::select! {
        res = ssh_broker::mcp::server::run_stdio(app.clone()) => res,
        _ = shutdown_signal() => Ok(()),
    };

    app.shutdown();
    guard.release();

    if let Err(err) = result {
        eprintln!("ssh-broker: {}", err.message);
        std::process::exit(1);
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = term.recv() => {},
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
