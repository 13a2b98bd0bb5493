//! Plan and status command implementations

use std::sync::Arc;

use anyhow::Result;

use crate::output::{format_plans, print_info, print_warning};
use crate::system_host;
use hg_core::config::HardeningConfig;
use hg_core::domains::reconciler;
use hg_core::pipeline::{Pipeline, PipelineRun};
use hg_core::reconcile::Context;

/// Show what `apply` would change, without changing anything
pub async fn plan_command(config: HardeningConfig, json: bool) -> Result<()> {
    let domains = Pipeline::standard(&config).domains();
    let ctx = Context::new(system_host(), Arc::new(config));

    let mut plans = Vec::with_capacity(domains.len());
    for domain in domains {
        plans.push(reconciler(domain).plan(&ctx).await?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }

    print!("{}", format_plans(&plans));
    let pending = plans.iter().filter(|p| !p.diff.is_empty()).count();
    if pending == 0 {
        print_info("Host already matches the declared configuration");
    } else {
        print_info(&format!("{} domain(s) would change; run 'hostguard apply'", pending));
    }
    Ok(())
}

/// Show probed live state of every enabled domain and the last run
pub async fn status_command(config: HardeningConfig, json: bool) -> Result<()> {
    let domains = Pipeline::standard(&config).domains();
    let host = system_host();
    let last = PipelineRun::load_last(&host.path(&config.pipeline.state_dir));
    let ctx = Context::new(host, Arc::new(config));

    let mut states = serde_json::Map::new();
    for domain in domains {
        let value = match reconciler(domain).status(&ctx).await {
            Ok(value) => value,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        states.insert(domain.to_string(), value);
    }

    if json {
        let last = last.ok().flatten();
        let report = serde_json::json!({ "domains": states, "last_run": last });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (domain, state) in &states {
        println!("{}:", domain);
        println!("{}\n", serde_json::to_string_pretty(state)?);
    }
    match last {
        Ok(Some(run)) => print_info(&format!(
            "Last run {} at {}: {}",
            run.id(),
            run.started_at(),
            run.state()
        )),
        Ok(None) => print_info("No previous run recorded"),
        Err(e) => print_warning(&format!("Cannot read last run report: {}", e)),
    }
    Ok(())
}
