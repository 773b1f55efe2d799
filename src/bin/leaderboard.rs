use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, ensure};
use chrono::Utc;
use serde_json::json;
use spendthrone::{config::ThroneConfig, engine::ThroneService, leaderboard::ReadSource};

const CONFIG_PATH: &str = "configs/mainnet.yaml";
const LIMIT: usize = 1_000;
const ALLOW_DEGRADED: bool = false;
const PRETTY_JSON: bool = true;
const OUTPUT_PATH: &str = "leaderboard.json";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_PATH));
    let config = ThroneConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let service = ThroneService::new(config)?;
    let page = service.leaderboard().top(LIMIT, None).await;
    ensure!(
        ALLOW_DEGRADED || page.source == ReadSource::Live,
        "durable store unavailable, refusing to export a {:?} leaderboard",
        page.source
    );
    let count = page.entries.len();
    let report = json!({
        "exported_at": Utc::now(),
        "source": page.source,
        "entries": page.entries,
    });
    let rendered = if PRETTY_JSON {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    fs::write(output_path(), rendered.as_bytes())
        .with_context(|| format!("failed to write {}", OUTPUT_PATH))?;
    println!("wrote {count} leaderboard entries to {OUTPUT_PATH}");
    Ok(())
}

fn output_path() -> PathBuf {
    PathBuf::from(OUTPUT_PATH)
}
