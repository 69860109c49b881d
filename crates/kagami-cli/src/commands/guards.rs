use std::any::Any;
use std::process::ExitCode;

use crate::cli::{GuardsArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::errors::AppResult;
use crate::guards::{self, GuardReport};
use crate::output::render_guards;

pub struct GuardsHandler {
    args: GuardsArgs,
    run_guards: Box<dyn Fn(&GuardsArgs) -> AppResult<GuardReport> + Send + Sync>,
    render: Box<dyn Fn(&GuardReport, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl GuardsHandler {
    pub fn new(args: GuardsArgs) -> Self {
        Self::with_dependencies(args, guards::run_guards, render_guards)
    }

    pub fn with_dependencies(
        args: GuardsArgs,
        run_guards: impl Fn(&GuardsArgs) -> AppResult<GuardReport> + Send + Sync + 'static,
        render: impl Fn(&GuardReport, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run_guards: Box::new(run_guards),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for GuardsHandler {
    /// Exits non-zero when either stage would skip biometric authentication.
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let report = (self.run_guards)(&self.args)?;
        (self.render)(&report, mode)?;
        let proceed = report.unlocked.proceed
            && report.locked.as_ref().map_or(false, |stage| stage.proceed);
        Ok(if proceed {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
