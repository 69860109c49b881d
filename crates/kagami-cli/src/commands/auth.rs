use std::any::Any;
use std::process::ExitCode;

use crate::auth::{self, AuthRunConfig, AuthSummary};
use crate::cli::{AuthArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::errors::AppResult;
use crate::output::render_auth;

type RunAuth = dyn Fn(&AuthRunConfig) -> AppResult<AuthSummary> + Send + Sync;
type RenderAuth = dyn Fn(&AuthSummary, OutputMode, bool) -> AppResult<()> + Send + Sync;

pub struct AuthHandler {
    config: AuthRunConfig,
    run_auth: Box<RunAuth>,
    render: Box<RenderAuth>,
}

impl AuthHandler {
    pub fn new(args: AuthArgs) -> Self {
        Self::with_dependencies(args, auth::run_auth, render_auth)
    }

    pub fn with_dependencies(
        args: AuthArgs,
        run_auth: impl Fn(&AuthRunConfig) -> AppResult<AuthSummary> + Send + Sync + 'static,
        render: impl Fn(&AuthSummary, OutputMode, bool) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config: AuthRunConfig::from(&args),
            run_auth: Box::new(run_auth),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for AuthHandler {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode> {
        let summary = (self.run_auth)(&self.config)?;
        (self.render)(&summary, mode, verbose)?;
        let exit = if summary.success {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        };
        Ok(exit)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
