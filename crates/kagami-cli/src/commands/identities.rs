use std::any::Any;
use std::process::ExitCode;

use crate::cli::{IdentitiesArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::errors::AppResult;
use crate::identities::{self, IdentitiesReport};
use crate::output::render_identities;

pub struct IdentitiesHandler {
    args: IdentitiesArgs,
    run_identities: Box<dyn Fn(&IdentitiesArgs) -> AppResult<IdentitiesReport> + Send + Sync>,
    render: Box<dyn Fn(&IdentitiesReport, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl IdentitiesHandler {
    pub fn new(args: IdentitiesArgs) -> Self {
        Self::with_dependencies(args, identities::run_identities, render_identities)
    }

    pub fn with_dependencies(
        args: IdentitiesArgs,
        run_identities: impl Fn(&IdentitiesArgs) -> AppResult<IdentitiesReport>
            + Send
            + Sync
            + 'static,
        render: impl Fn(&IdentitiesReport, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run_identities: Box::new(run_identities),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for IdentitiesHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let report = (self.run_identities)(&self.args)?;
        (self.render)(&report, mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
