use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use harvest_agent::harvest::HttpTransport;
use harvest_agent::kernel::aggregator::Attributes;
use harvest_agent::kernel::event::{ErrorEvent, Vital, VitalKind};
use harvest_agent::kernel::time::Tick;
use harvest_agent::{Agent, AgentConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Setup Logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    // 2. Config: optional TOML path as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => AgentConfig::load(&PathBuf::from(path))?,
        None => AgentConfig::default(),
    };
    tracing::info!("Harvest agent booting (agent id {})", config.agent_id);

    let transport = Arc::new(HttpTransport::new(&config)?);

    // 3. Phase one: instrumentation is live before any feature exists
    let mut agent = Agent::install(config);
    agent.notice_error(
        ErrorEvent::new(Tick::new(), "TypeError", "x is undefined").with_stack("at boot (app.js:1:1)"),
    );
    agent.record_timing(Vital {
        at: Tick::new(),
        kind: VitalKind::FirstContentfulPaint,
        value: 412.0,
        attributes: Attributes::new(),
    });

    // 4. Phase two: attach aggregates, replay what was buffered
    agent.attach_features(Tick::new());

    let mut attrs = Attributes::new();
    attrs.insert("source".into(), Value::from("cli"));
    agent.add_custom_event(Tick::new(), "AgentStarted", attrs);
    agent.record_supportability("Agent/Boot", 1.0);

    // 5. Run until Ctrl+C, then final harvest
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    tracing::info!("Harvest loop active. Press Ctrl+C to stop.");
    agent.run(transport, shutdown).await;
    Ok(())
}
