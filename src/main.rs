use std::path::PathBuf;

use claude_api_server::{config, server};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);

    if let Err(err) = server::run(config_path).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
