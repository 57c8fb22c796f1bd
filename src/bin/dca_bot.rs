//! Paper trading binary
//!
//! ```bash
//! cargo run --bin dca_bot -- config.toml
//! ```
//!
//! Settings can be overridden from the environment or a `.env` file, e.g.
//! `APP__ENGINE__STEP_INTERVAL_MS=5000`.

use dca_engine::EngineRunner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let default_config = "config.toml".to_string();
    let config_path = args.get(1).unwrap_or(&default_config);
    if !std::path::Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Please create one.", config_path);
        std::process::exit(1);
    }

    let runner = EngineRunner::new(config_path)?;

    if let Err(e) = runner.run().await {
        eprintln!("Engine error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
