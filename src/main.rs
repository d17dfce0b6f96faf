//! dagserve demo - Main Entry Point
//!
//! Loads a demultiplexing pipeline definition, validates it against the
//! mock accelerator and runs one request through it.

use anyhow::Context;
use dagserve::{
    accelerator::mock::{MockAcceleratorManager, MockModelConfig},
    config::{EngineConfig, LoggingSettings, PipelineConfigFile},
    pipeline::NodeLibraryRegistry,
    types::{shape_to_string, InferenceRequest, Tensor},
    ModelManager,
};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry demultiplexes [2, 1, 5] into two [1, 5] shards for the dummy model
const DEMO_PIPELINES: &str = r#"
{
    "pipeline_config_list": [
        {
            "name": "demultiply_dummy",
            "inputs": ["in"],
            "demultiply_count": 2,
            "nodes": [
                {
                    "name": "dummy_node",
                    "type": "DL model",
                    "model_name": "dummy",
                    "inputs": [{"b": {"node_name": "request", "data_item": "in"}}],
                    "outputs": [{"data_item": "a", "alias": "dummy_out"}]
                }
            ],
            "outputs": [{"result": {"node_name": "dummy_node", "data_item": "dummy_out"}}]
        }
    ]
}"#;

fn init_logging(settings: &LoggingSettings) -> Option<WorkerGuard> {
    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "dagserve.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level)))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load_or_default(EngineConfig::default_path());
    let _log_guard = init_logging(&config.logging);

    tracing::info!("Starting dagserve demo");

    let manager = Arc::new(MockAcceleratorManager::new().context("Failed to start mock accelerator")?);
    manager.load(MockModelConfig::dummy("dummy", 5).with_nireq(2));
    let libraries = NodeLibraryRegistry::new();

    let file = PipelineConfigFile::from_json(DEMO_PIPELINES)?;
    let definitions = file.definitions(&config.scheduler)?;
    let definition = definitions
        .first()
        .context("Demo config holds no pipeline")?;
    definition.validate(manager.as_ref(), &libraries)?;

    let values: Vec<f32> = (0..10).map(|v| v as f32).collect();
    let request =
        InferenceRequest::new().with_input("in", Tensor::from_f32(vec![2, 1, 5], &values)?);

    let mut pipeline = definition.create(request, manager.clone(), &libraries)?;
    let response = pipeline
        .execute()
        .with_context(|| format!("Pipeline {} failed", definition.name()))?;
    drop(pipeline);

    let result = response
        .output("result")
        .context("Response is missing output 'result'")?;
    tracing::info!(
        "Result {}: {:?}",
        shape_to_string(result.shape()),
        result.to_f32_vec().unwrap_or_default()
    );

    let (model, _guard) = manager.find_model_instance("dummy", None)?;
    let stats = model.infer_requests_queue().stats();
    tracing::info!(
        "Stream pool: {} acquires, {} releases, avg wait {:.1}us",
        stats.acquires,
        stats.releases,
        stats.avg_wait_us()
    );

    definition.retire();
    tracing::info!("Shutting down...");
    Ok(())
}
