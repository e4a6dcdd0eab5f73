use anyhow::{Context, Result};
use registry_client::{ClientConfig, RegistrationAgent, RegistryMetrics, RegistryTransport, ServiceResolver};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ClientConfig::load().context("failed to load registry configuration")?;
    info!("Starting registry agent for {} on port {}", config.app_name, config.port);

    let metrics = RegistryMetrics::new()?;
    let transport = Arc::new(
        RegistryTransport::new(config.registry_urls.clone(), config.request_timeout())?
            .with_metrics(metrics.clone()),
    );

    let instance = config.instance_record()?;
    let agent = RegistrationAgent::new(transport.clone(), instance, config.agent_options());

    if let Err(e) = agent.start().await {
        error!("Startup aborted: {}", e);
        agent.shutdown().await;
        return Err(e.into());
    }

    let resolver = ServiceResolver::new(transport);
    resolve_services(&resolver, &config.resolve_services).await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, deregistering...");

    agent.shutdown().await;

    match metrics.gather() {
        Ok(text) => debug!("Final registry metrics:\n{}", text),
        Err(e) => warn!("Could not render metrics: {}", e),
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("REGISTRY_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let subscriber = tracing_subscriber::registry().with(filter);
    if json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn resolve_services(resolver: &ServiceResolver, services: &[String]) {
    if services.is_empty() {
        return;
    }

    let known = resolver.list_service_names().await;
    debug!("Registry lists {} services: {}", known.len(), known.join(", "));

    for service in services {
        match resolver.resolve_url(service).await {
            Ok(url) => info!("Resolved {} to {}", service, url),
            Err(e) if e.is_no_instances() => warn!("{}", e),
            Err(e) => error!("Could not resolve {}: {}", service, e),
        }
    }
}
