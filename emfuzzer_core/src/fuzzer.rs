use crate::coap::{Validator, ValidatorResult};
use crate::config::FuzzerConfig;
use crate::context::Context;
use crate::delay::Delay;
use crate::input::Case;
use crate::net::{Consumer, NetworkReactor};
use crate::results::Results;
use crate::tasks::Tasks;
use anyhow::Context as _;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Results group holding the protocol validator's verdicts.
pub const VALIDATOR_GROUP: &str = "coapp";

/// Invocation arguments, recorded verbatim in the report.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct RunArgs {
    pub data: Vec<PathBuf>,
    pub output_prefix: String,
    pub config: PathBuf,
}

impl RunArgs {
    pub fn report_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.json", self.output_prefix))
    }
}

/// Runs every case, writes `<output-prefix>.json` and returns the number of
/// non-success results.
pub fn fuzz(args: &RunArgs, config: &FuzzerConfig) -> anyhow::Result<usize> {
    let validator = Arc::new(Validator::new(
        config.target.clone(),
        config.validator.timeout(),
    ));

    let mut results = Results::new(args, config)?;
    results.register(VALIDATOR_GROUP, ValidatorResult::Success)?;

    let mut context = Context::start().context("Failed to start subprocess reader")?;
    let mut setups =
        Tasks::from_config("case.setups", &config.case.setups, &context, &mut results)?;
    let mut checks =
        Tasks::from_config("case.checks", &config.case.checks, &context, &mut results)?;
    let mut monitoring = Tasks::from_config(
        "case.monitoring",
        &config.case.monitoring,
        &context,
        &mut results,
    )?;

    let before_sending = Delay::from_millis(
        "case.delays.before_sending",
        config.case.delays.before_sending_ms,
    );
    let between_cases = Delay::from_millis(
        "case.delays.between_cases",
        config.case.delays.between_cases_ms,
    );

    let consumer: Arc<dyn Consumer> = validator.clone();
    let mut reactor = NetworkReactor::start(
        config.network.bind,
        config.network.send_queue_capacity,
        consumer,
    )
    .with_context(|| format!("Failed to open UDP socket on {}", config.network.bind))?;

    for path in &args.data {
        let Some(case) = Case::load(path)? else {
            continue;
        };
        let key = results.add_key(case.key());
        let key = key.as_str();

        setups.execute_for(key, &mut results);

        monitoring.monitor(key, &mut results, |results| {
            before_sending.wait();
            let result = match reactor.send(&config.target, case.as_bytes()) {
                Ok(()) => validator.wait_for_result(),
                Err(e) => {
                    error!("Failed to send {key}: {e}");
                    ValidatorResult::Timedout
                }
            };
            if let Err(e) = results.collect(VALIDATOR_GROUP, key, result) {
                error!("Failed to record validator result for {key}: {e}");
            }

            checks.execute_for(key, results);
        });

        between_cases.wait();
    }

    reactor.stop();
    context.teardown();

    results.finish(&validator.extra_stats())?;
    info!("Results:\n{}", results.summary());

    let report = args.report_path();
    results
        .write_report(&report)
        .with_context(|| format!("Failed to write report {}", report.display()))?;
    info!("Report written to {}", report.display());

    Ok(results.total_errors())
}
