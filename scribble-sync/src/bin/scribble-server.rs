//! Standalone sync server for the shared whiteboard.

use scribble_sync::{ServerConfig, SyncServer};

fn print_usage() -> ! {
    eprintln!("Usage: scribble-server <port>");
    eprintln!("With:");
    eprintln!("\tport: port number to listen on");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 || args[1] == "-h" || args[1] == "--help" {
        print_usage();
    }
    let port: u16 = match args[1].parse() {
        Ok(p) => p,
        Err(_) => print_usage(),
    };

    let config = ServerConfig {
        bind_addr: format!("0.0.0.0:{port}"),
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config);
    log::info!("Server is ready on port {port}");

    if let Err(e) = server.run().await {
        log::error!("Server terminated: {e}");
        std::process::exit(1);
    }
}
