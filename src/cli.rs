//! Command-line arguments shared by the pipeline binaries.

use chrono::{DateTime, Utc};
use clap::Parser;

use crate::time_index::{current_hour, floor_hour, parse_run_datetime};

#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
    /// Run time in UTC as "YYYY-MM-DD HH:MM:SS" (defaults to the current hour)
    #[arg(long, value_parser = parse_datetime_arg)]
    pub datetime: Option<DateTime<Utc>>,
}

impl RunArgs {
    /// The run time truncated to the hour.
    pub fn run_time(&self) -> DateTime<Utc> {
        self.datetime.map(floor_hour).unwrap_or_else(current_hour)
    }
}

fn parse_datetime_arg(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_run_datetime(raw).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn datetime_is_floored_to_the_hour() {
        let args =
            RunArgs::try_parse_from(["feature_pipeline", "--datetime", "2023-03-02 10:45:00"])
                .unwrap();
        assert_eq!(
            args.run_time(),
            Utc.with_ymd_and_hms(2023, 3, 2, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn missing_datetime_uses_current_hour() {
        let args = RunArgs::try_parse_from(["feature_pipeline"]).unwrap();
        assert!(args.datetime.is_none());
        assert_eq!(args.run_time(), floor_hour(args.run_time()));
    }

    #[test]
    fn malformed_datetime_is_rejected() {
        assert!(RunArgs::try_parse_from(["feature_pipeline", "--datetime", "2023-03-02"]).is_err());
    }
}
