use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::Parser;
use taxi_demand::{
    app_config_from_env, init_logging, log_pipeline_failed, log_pipeline_finish,
    log_pipeline_start, log_sink_selected, logging_config_from_env, persist, records_from_hourly,
    records_from_windows, sink_from_config, FeatureGroupConfig, MonthlyRideFiles, PipelineError,
    PipelineOrchestrator, RunArgs,
};

const PIPELINE: &str = "feature_pipeline";

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
    let out = orchestrator.rolling_update(run_time)?;

    let hourly = persist(
        sink.as_ref(),
        &FeatureGroupConfig::time_series_hourly(),
        &records_from_hourly(&out.hourly),
        &cfg.persist_retry,
    )?;
    let windows = records_from_windows(&out.schema, &out.features, Some(out.targets.as_slice()))?;
    let windows = persist(
        sink.as_ref(),
        &FeatureGroupConfig::training_windows(),
        &windows,
        &cfg.persist_retry,
    )?;

    Ok(hourly + windows)
}
