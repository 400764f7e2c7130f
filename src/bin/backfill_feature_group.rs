use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::Parser;
use taxi_demand::{
    app_config_from_env, init_logging, log_pipeline_failed, log_pipeline_finish,
    log_pipeline_start, log_sink_selected, logging_config_from_env, persist, records_from_hourly,
    sink_from_config, FeatureGroupConfig, MonthlyRideFiles, PipelineError, PipelineOrchestrator,
    RunArgs,
};
use tracing::info;

const PIPELINE: &str = "backfill_feature_group";

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
    let source = MonthlyRideFiles::new(cfg.raw_rides.clone())?;
    let sink = sink_from_config(&cfg)?;
    log_sink_selected(PIPELINE, &sink.describe());

    let orchestrator = PipelineOrchestrator::new(cfg.pipeline, &source);
    let out = orchestrator.backfill(run_time)?;
    info!(
        component = PIPELINE,
        event = "backfill.range",
        from = %out.from,
        to_exclusive = %out.to_exclusive,
        locations = out.densify_report.locations,
        hours = out.densify_report.hours
    );

    persist(
        sink.as_ref(),
        &FeatureGroupConfig::time_series_hourly(),
        &records_from_hourly(&out.hourly),
        &cfg.persist_retry,
    )
}
