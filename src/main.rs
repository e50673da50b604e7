use site_proximity::config::Settings;
use site_proximity::jobs::{read_job_request, JobRegistry, JobRequest, JobStatusResponse};
use site_proximity::pipeline::artifact::ANALYSIS_FILE;
use site_proximity::pipeline::{Analyzer, RunStatus};
use site_proximity::provider::{HashingProvider, HttpVectorProvider, VectorProvider};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Vector width of the offline provider selected with `EMBEDDINGS_ENDPOINT=mock`
const MOCK_DIMENSIONS: usize = 384;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("site_proximity=info")),
        )
        .init();
    println!("Site Proximity Analyzer\n");

    // Either `<pages.json> [edges.json] [project_id]` or a JSON job request
    let args: Vec<String> = env::args().collect();
    let request = if args.len() >= 2 {
        let pages_path = PathBuf::from(&args[1]);
        let project_id = args.get(3).cloned().unwrap_or_else(|| {
            pages_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string())
        });
        JobRequest {
            project_id,
            pages_path,
            edges_path: args.get(2).map(PathBuf::from),
        }
    } else {
        match read_job_request() {
            Ok(request) => request,
            Err(e) => {
                eprintln!("{}", e);
                eprintln!("\nUsage: {} <pages.json> [edges.json] [project_id]", args[0]);
                eprintln!("   or: ANALYSIS_JOB='{{\"project_id\": ..., \"pages_path\": ...}}' {}", args[0]);
                std::process::exit(1);
            }
        }
    };

    let settings = Settings::from_env()?;

    println!("Project: {}", request.project_id);
    println!("Pages:   {}", request.pages_path.display());
    if let Some(edges) = &request.edges_path {
        println!("Edges:   {}", edges.display());
    }

    let pages = request.load()?;
    println!("\nLoaded {} pages and {} links", pages.len(), pages.edges.len());

    let provider: Arc<dyn VectorProvider> = if settings.embedding.endpoint == "mock" {
        println!("   • Provider: offline hashing ({} dims)", MOCK_DIMENSIONS);
        Arc::new(HashingProvider::new(MOCK_DIMENSIONS))
    } else {
        println!(
            "   • Provider: {} ({})",
            settings.embedding.endpoint, settings.embedding.model
        );
        Arc::new(HttpVectorProvider::new(
            &settings.embedding.endpoint,
            &settings.embedding.model,
            settings.embedding.timeout,
        )?)
    };

    let registry = JobRegistry::new(Analyzer::new(provider, settings));
    let handle = registry.start(&request.project_id, pages)?;

    // Print a banner whenever the run changes stage
    let mut rx = handle.subscribe();
    loop {
        let status = *rx.borrow_and_update();
        match status {
            RunStatus::Pending => {}
            RunStatus::Embedding => println!("\n🟪 Phase 1: Generating embeddings..."),
            RunStatus::Indexing => println!("\n🟩 Phase 2: Finding semantic neighbors..."),
            RunStatus::Clustering => println!("\n🟨 Phase 3: Clustering and projecting..."),
            RunStatus::Scoring => println!("\n🟧 Phase 4: Scoring proximity anomalies..."),
            RunStatus::Completed | RunStatus::Failed => break,
        }
        if rx.changed().await.is_err() {
            break;
        }
    }

    let response = JobStatusResponse::from_handle(&handle);

    let Some(result) = handle.result() else {
        eprintln!(
            "\n❌ Analysis failed at step {}/{}: {}",
            response.progress.step,
            response.progress.total_steps,
            response.error.as_deref().unwrap_or("unknown error")
        );
        println!("{}", serde_json::to_string(&response)?);
        std::process::exit(1);
    };

    println!("\nClustering Results:");
    println!("   • Method: {:?}", result.clustering_method);
    println!("   • Projection: {:?}", result.projection_method);
    println!("   • Clusters: {}", result.clusters.len());
    println!("   • Noise points: {}", result.noise_points);
    for cluster in result.clusters.iter().take(5) {
        println!(
            "   • Cluster {} ({} pages): {}",
            cluster.cluster_id,
            cluster.size,
            cluster.theme.as_deref().unwrap_or("-")
        );
    }

    println!("\n📊 Link Graph:");
    println!("   • Total nodes: {}", result.graph_stats.total_nodes);
    println!("   • Total edges: {}", result.graph_stats.total_edges);

    let summary = &result.summary;
    println!("\n🔗 Proximity Anomalies:");
    println!("   • Semantic pairs: {}", summary.semantic_pairs);
    println!("   • Anomalies: {}", summary.proximity_anomalies);
    println!("   • Average score: {:.3}", summary.avg_anomaly_score);
    println!("   • Average cluster coherence: {:.3}", summary.avg_cluster_coherence);

    for anomaly in result.proximities.iter().take(10) {
        let hops = anomaly
            .hops
            .map(|h| h.to_string())
            .unwrap_or_else(|| "unreachable".to_string());
        println!(
            "   • {:.3}  {} -> {} (cos {:.3}, {} hops)",
            anomaly.anomaly_score, anomaly.url_i, anomaly.url_j, anomaly.cosine, hops
        );
    }
    if result.proximities.len() > 10 {
        println!("   ... and {} more pairs", result.proximities.len() - 10);
    }

    println!("\n✅ Analysis complete!");
    println!("   Embeddings: {}", result.embeddings_path.display());
    println!(
        "   Results: {}",
        result.embeddings_path.with_file_name(ANALYSIS_FILE).display()
    );

    Ok(())
}
