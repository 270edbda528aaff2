use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use placegen::{
    ArtifactRef, Coalescer, CoalescerConfig, ImageBackend, NormalizedRequest, RequestAttributes,
    WaitPolicy,
};

/// Stand-in for the remote image service: slow, and counts its calls
struct SlowBackend {
    latency: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl ImageBackend for SlowBackend {
    async fn generate(&self, request: &NormalizedRequest) -> Result<ArtifactRef> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "backend generating {}x{} {} for '{}'",
            request.width, request.height, request.format, request.prompt
        );
        tokio::time::sleep(self.latency).await;
        Ok(ArtifactRef::new(format!("https://cdn/img{}", n)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let coalescer = Coalescer::new(CoalescerConfig::development())?;
    let janitor = coalescer.spawn_janitor();
    let backend = Arc::new(SlowBackend {
        latency: Duration::from_millis(2000),
        calls: AtomicUsize::new(0),
    });

    let sunset = RequestAttributes::new("A beautiful sunset", 1024, 1024, "jpg");
    let policy = WaitPolicy::notify(Duration::from_secs(10));

    println!("Five callers ask for the same image at once...");
    let started = Instant::now();
    let outcomes = join_all(
        (0..5).map(|_| coalescer.resolve_with_backend(&sunset, Arc::clone(&backend), &policy)),
    )
    .await;
    for (caller, outcome) in outcomes.into_iter().enumerate() {
        let resolution = outcome?;
        println!(
            "  caller {} -> {} ({})",
            caller,
            resolution.artifact(),
            resolution.source().as_str()
        );
    }
    println!(
        "Backend calls: {}, elapsed: {:?}",
        backend.calls.load(Ordering::SeqCst),
        started.elapsed()
    );

    let again = coalescer
        .resolve_with_backend(&sunset, Arc::clone(&backend), &policy)
        .await?;
    println!("Repeat request -> {} ({})", again.artifact(), again.source().as_str());

    // A follower with a short deadline gets "still generating" while the
    // leader carries on.
    let storm = RequestAttributes::new("A storm over the sea", 800, 600, "png");
    let impatient = WaitPolicy::notify(Duration::from_millis(100));
    let (leader, follower) = tokio::join!(
        coalescer.resolve_with_backend(&storm, Arc::clone(&backend), &policy),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            coalescer
                .resolve_with_backend(&storm, Arc::clone(&backend), &impatient)
                .await
        }
    );
    match follower {
        Err(e) if e.is_still_generating() => warn!("follower gave up: {}", e),
        other => println!("Unexpected follower outcome: {:?}", other),
    }
    println!("Leader -> {}", leader?.artifact());

    println!("Metrics: {}", coalescer.metrics().to_json());

    janitor.shutdown();
    Ok(())
}
