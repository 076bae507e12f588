/// Smoke-test for the full fetch pipeline over `ReqwestTransport`.
///
/// Runs a GET through the queue + breaker against a public endpoint and
/// prints the health snapshot.
///
/// Run with:
///   cargo run --example fetch_smoke
use argus_client::ReqwestTransport;
use argus_core::{FetchRequest, FetchService, TransportRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .init();

    let transport = ReqwestTransport::new()?;
    let service = FetchService::new(transport);

    let url = "https://httpbin.org/json";
    println!("Fetching {url} …");
    let response = service
        .fetch(FetchRequest::new(TransportRequest::get(url)))
        .await?;

    println!(
        "OK — HTTP {} in {} ms",
        response.status,
        response.duration.as_millis()
    );

    service.drain().await;
    let health = service.health();
    println!(
        "health: circuit={} processed={} success_rate={:.2}",
        health.circuit.state, health.queue.total_processed, health.circuit.success_rate
    );
    Ok(())
}
