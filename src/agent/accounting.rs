use super::{Agent, ACCOUNTING_KEY};
use crate::database::StatusKind;
use crate::error::{AppError, HandlerResult};
use crate::exchange::Scope;
use crate::models::AccountingEndpoint;

impl Agent {
    //////////////////////////////////////////////////////////////////////////////////////////////
    // Accounting Reconciliation /////////////////////////////////////////////////////////////////

    /// Publish the accounting backend's endpoint to the role scope.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn publish_accounting(&mut self) -> HandlerResult {
        if !self.is_writer() {
            return Err(AppError::Rejected("this agent is not the accounting role's writer".into()));
        }
        let endpoint = AccountingEndpoint {
            host: self.config.hostname.clone(),
            address: self.config.ingress_address.clone(),
            port: self.config.daemon_port,
        };
        self.publish_model(Scope::Role(self.config.role_name.clone()), ACCOUNTING_KEY, &endpoint)
            .await?;
        self.set_status(StatusKind::Active, format!("accounting backend serving {}:{}", endpoint.address, endpoint.port));
        Ok(())
    }
}
