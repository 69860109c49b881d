use std::any::Any;
use std::process::ExitCode;

use tracing::{info, warn};

use crate::cli::OutputMode;
use crate::commands::CommandHandler;
use crate::doctor::{self, CheckStatus, DoctorOutcome};
use crate::errors::AppResult;
use crate::output::render_doctor;

type RunDoctor = Box<dyn Fn() -> AppResult<DoctorOutcome> + Send + Sync>;
type RenderDoctor = Box<dyn Fn(&DoctorOutcome, OutputMode) -> AppResult<()> + Send + Sync>;

pub struct DoctorHandler {
    run_doctor: RunDoctor,
    render: RenderDoctor,
}

impl DoctorHandler {
    pub fn new() -> Self {
        Self::with_dependencies(doctor::run_doctor, render_doctor)
    }

    pub fn with_dependencies(
        run_doctor: impl Fn() -> AppResult<DoctorOutcome> + Send + Sync + 'static,
        render: impl Fn(&DoctorOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            run_doctor: Box::new(run_doctor),
            render: Box::new(render),
        }
    }
}

impl Default for DoctorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandHandler for DoctorHandler {
    /// Warnings are reported but leave the exit status at 0; any failed
    /// check exits 1 so install scripts can gate on it.
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let outcome = (self.run_doctor)()?;
        (self.render)(&outcome, mode)?;

        let failed = outcome.names_with(CheckStatus::Fail);
        let warned = outcome.names_with(CheckStatus::Warn);
        if !warned.is_empty() {
            info!(target: "kagami::doctor", checks = %warned.join(","), "doctor warnings");
        }
        if failed.is_empty() && outcome.ok {
            return Ok(ExitCode::SUCCESS);
        }
        warn!(target: "kagami::doctor", checks = %failed.join(","), "doctor found failures");
        Ok(ExitCode::from(1))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
