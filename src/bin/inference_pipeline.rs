use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::Parser;
use taxi_demand::{
    app_config_from_env, init_logging, log_pipeline_failed, log_pipeline_finish,
    log_pipeline_start, log_sink_selected, logging_config_from_env, persist,
    records_from_predictions, sink_from_config, BaselineRegistry, FeatureGroupConfig,
    ModelRegistry, MonthlyRideFiles, PipelineError, PipelineOrchestrator, RunArgs,
};
use tracing::warn;

const PIPELINE: &str = "inference_pipeline";

fn main() -> ExitCode {
    let logging = logging_config_from_env();
    if let Err(err) = init_logging(&logging) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let run_time = RunArgs::parse().run_time();
    log_pipeline_start(PIPELINE, run_time, &logging);

    match run(run_time) {
        Ok(written) => {
            log_pipeline_finish(PIPELINE, written);
            ExitCode::SUCCESS
        }
        Err(err) => {
            log_pipeline_failed(PIPELINE, &err);
            ExitCode::FAILURE
        }
    }
}

fn run(run_time: DateTime<Utc>) -> Result<usize, PipelineError> {
    let cfg = app_config_from_env()?;
    let model = BaselineRegistry.load(&cfg.model_name, &cfg.model_status)?;
    let source = MonthlyRideFiles::new(cfg.raw_rides.clone())?;
    let sink = sink_from_config(&cfg)?;
    log_sink_selected(PIPELINE, &sink.describe());

    let orchestrator = PipelineOrchestrator::new(cfg.pipeline, &source);
    let batch = orchestrator.inference_batch(run_time)?;
    if !batch.window_report.short_histories.is_empty() {
        warn!(
            component = PIPELINE,
            event = "inference.locations_skipped",
            skipped = batch.window_report.short_histories.len()
        );
    }

    let predictions = orchestrator.predict(&batch, model.as_ref())?;
    persist(
        sink.as_ref(),
        &FeatureGroupConfig::model_predictions(),
        &records_from_predictions(&predictions),
        &cfg.persist_retry,
    )
}
