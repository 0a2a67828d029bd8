use clap::Parser;
use std::sync::Arc;
use std::thread;
use visage_base::log_fatal;
use visage_server::{handle_client, Args, ServerConfig, SessionPool};

fn main() {
    visage_base::init_stdout_logger();

    let args = Args::parse();
    let config = match ServerConfig::from_args(args) {
        Ok(config) => config,
        Err(message) => log_fatal!("{}", message),
    };

    log::info!(
        "Starting visage inference server on ws://{}:{}",
        config.host,
        config.port
    );
    log::info!("Model: {}", config.model);
    log::info!("Max sessions: {}", config.max_sessions);

    let pool = match SessionPool::init(&config) {
        Ok(pool) => Arc::new(pool),
        Err(err) => log_fatal!("Session pool init failed: {}", err),
    };

    let listener = match visage_ws::listen(&config.host, config.port) {
        Ok(listener) => listener,
        Err(err) => log_fatal!("Failed to bind/listen on {}:{}: {}", config.host, config.port, err),
    };

    for connection in listener.incoming() {
        match connection {
            Ok(stream) => {
                let pool = pool.clone();
                thread::spawn(move || handle_client(stream, pool));
            }
            Err(err) => {
                log::warn!("Accept error: {}", err);
            }
        }
    }
}
