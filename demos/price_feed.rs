//! A price feed sorted by a digest, with a watchdog that pauses the feed.
//!
//! Run with `RUST_LOG=agent_mesh=debug,info cargo run --example price_feed`.

use std::error::Error;

use agent_mesh::{Registry, Runner, WorkflowConfig};
use tracing_subscriber::EnvFilter;

const WORKFLOW: &str = r#"
name = "price-feed"

[runtime]
agent_log_length = 50

[[agents]]
name = "feed"
type = "emitter"
schedule = "every_1h"

[agents.options]
payloads = [
    { item = "coffee", price = 30 },
    { item = "tea", price = 10 },
    { item = "cocoa", price = 20 },
]

[[agents]]
name = "cheapest-first"
type = "digest"
schedule = "6am"

[agents.options]
messages_order = [["{{ price }}", "number", false]]
include_sort_info = true

[[agents]]
name = "watchdog"
type = "commander"
schedule = "never"

[agents.options]
action = "{% if price > 25 %}disable{% endif %}"

[[links]]
source = "feed"
receiver = "cheapest-first"

[[links]]
source = "feed"
receiver = "watchdog"

[[control_links]]
controller = "watchdog"
target = "feed"
"#;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn drain(runner: &Runner) -> Result<(), Box<dyn Error>> {
    runner.propagate()?;
    let report = runner.work_off();
    println!(
        "drained: {} completed, {} skipped, {} failed",
        report.completed, report.skipped, report.failed
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let runner = WorkflowConfig::parse(WORKFLOW)?
        .into_runner(Registry::with_builtins())?
        .with_tracing();
    let wf = runner.workflow();
    let feed = wf.agent_by_name("feed")?;
    let digest = wf.agent_by_name("cheapest-first")?;
    let watchdog = wf.agent_by_name("watchdog")?;

    // Preview the feed without touching any store.
    let preview = runner.dry_run_check(feed.id)?;
    println!("dry run would emit {} messages:", preview.messages.len());
    print!("{}", preview.log);

    // One hourly tick: the feed emits, the digest queues, the watchdog reacts.
    runner.run_schedule("every_1h".parse()?)?;
    drain(&runner)?;
    drain(&runner)?;

    // The morning digest flushes in price order.
    runner.run_schedule("6am".parse()?)?;
    drain(&runner)?;
    for message in wf.messages().query(&[digest.id], 0)? {
        println!(
            "{} at {} {}",
            message.payload["item"], message.payload["price"], message.payload["_sort_info_"]
        );
    }

    for entry in wf.logs().for_agent(watchdog.id) {
        println!("[watchdog] {} {}", entry.level.as_str(), entry.message);
    }
    println!("feed disabled: {}", wf.agent(feed.id)?.disabled);
    Ok(())
}
