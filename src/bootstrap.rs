//! Generic-execute bootstrap
//!
//! Statements reach the backend through a `SECURITY DEFINER` function that
//! runs its argument. It has to exist before any plan is dispatched; if it
//! is missing and cannot be provisioned, the whole run is aborted.

use crate::error::AppError;
use crate::executor::Transport;
use crate::migration::{is_identifier, Statement, StatementKind};
use tracing::{error, info, warn};

const PROBE_SQL: &str = "SELECT 1;";

/// How the generic execute function became available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    AlreadyPresent,
    Provisioned,
}

/// `CREATE OR REPLACE FUNCTION` for the generic execute entry point
pub fn exec_function_statement(function: &str) -> Statement {
    Statement {
        kind: StatementKind::ProvisionExec,
        text: format!(
            "CREATE OR REPLACE FUNCTION public.{}(query text)\n\
             RETURNS void\n\
             LANGUAGE plpgsql\n\
             SECURITY DEFINER\n\
             AS $$\n\
             BEGIN\n  EXECUTE query;\nEND;\n$$;\n\
             REVOKE ALL ON FUNCTION public.{}(text) FROM PUBLIC, anon, authenticated;",
            function, function
        ),
    }
}

pub struct Bootstrapper<'a> {
    rpc: &'a dyn Transport,
    direct: Option<&'a dyn Transport>,
    function: &'a str,
}

impl<'a> Bootstrapper<'a> {
    pub fn new(rpc: &'a dyn Transport, direct: Option<&'a dyn Transport>, function: &'a str) -> Self {
        Self { rpc, direct, function }
    }

    /// Make sure the generic execute function answers, provisioning it once if needed
    pub async fn ensure(&self) -> Result<BootstrapOutcome, AppError> {
        if !is_identifier(self.function) {
            return Err(AppError::Bootstrap(format!(
                "'{}' is not a valid function name",
                self.function
            )));
        }

        info!("🔧 Checking {} function...", self.function);
        let probe_error = match self.rpc.execute(PROBE_SQL).await {
            Ok(()) => {
                info!("{} function already exists", self.function);
                return Ok(BootstrapOutcome::AlreadyPresent);
            }
            Err(e) => e,
        };

        if probe_error.is_missing_function() {
            info!("{} function does not exist, creating it...", self.function);
        } else {
            warn!("⚠️  {} probe failed: {}", self.function, probe_error);
        }

        let statement = exec_function_statement(self.function);
        let Some(direct) = self.direct else {
            self.print_manual_instructions(&statement);
            return Err(AppError::Bootstrap(format!(
                "{} is unavailable ({}) and no DATABASE_URL is configured to create it",
                self.function, probe_error
            )));
        };

        if let Err(e) = direct.execute(&statement.text).await {
            error!("❌ Failed to create {} function: {}", self.function, e);
            self.print_manual_instructions(&statement);
            return Err(AppError::Bootstrap(e.to_string()));
        }

        // PostgREST caches the function list
        if let Err(e) = direct.execute("NOTIFY pgrst, 'reload schema';").await {
            warn!("⚠️  Schema cache reload request failed: {}", e);
        }

        match self.rpc.execute(PROBE_SQL).await {
            Ok(()) => {
                info!("✅ Successfully set up {} function", self.function);
                Ok(BootstrapOutcome::Provisioned)
            }
            Err(e) => {
                error!("❌ {} was created but still does not answer: {}", self.function, e);
                Err(AppError::Bootstrap(e.to_string()))
            }
        }
    }

    fn print_manual_instructions(&self, statement: &Statement) {
        error!("Please go to the SQL editor and execute this query, then run again:");
        error!("\n{}", statement.text);
    }
}
