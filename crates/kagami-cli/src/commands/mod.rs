use std::any::Any;
use std::process::ExitCode;

use crate::cli::{Commands, OutputMode};
use crate::errors::AppResult;

pub trait CommandHandler: Send + Sync {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode>;
    fn as_any(&self) -> &dyn Any;
}

mod auth;
mod doctor;
mod guards;
mod identities;

pub use auth::AuthHandler;
pub use doctor::DoctorHandler;
pub use guards::GuardsHandler;
pub use identities::IdentitiesHandler;

impl From<Commands> for Box<dyn CommandHandler> {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Auth(args) => Box::new(AuthHandler::new(args)),
            Commands::Guards(args) => Box::new(GuardsHandler::new(args)),
            Commands::Identities(args) => Box::new(IdentitiesHandler::new(args)),
            Commands::Doctor => Box::new(DoctorHandler::new()),
        }
    }
}
