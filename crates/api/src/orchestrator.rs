//! Client PHI orchestration inside the operational API.
//!
//! A PHI update moves through fixed stages: validate the request, check the
//! deployment mode, authorize against the operational store, dispatch the
//! patch to the broker, then mirror identity fields into the cache. Each
//! stage either hands on or ends the request with a [`ServiceError`]; the
//! broker is never contacted unless every earlier stage passed.

use serde_json::Value;
use sokana_contracts::fields::{
    IdentityCacheUpdate, PhiPatch, normalize_phi_input, strip_phi_from_operational,
};
use sokana_contracts::{
    PhiData, PhiFetchRequest, PhiUpdateRequest, Requester, Role, ServiceError, parse_client_id,
};
use sokana_policy::{Decision, Denial, PhiAction};
use uuid::Uuid;

use crate::broker::{BrokerError, PhiBrokerClient};
use crate::config::PhiStoreMode;
use crate::directory::{ClientDirectory, DirectoryError};

pub const UPDATE_SUCCESS_MESSAGE: &str = "PHI fields updated successfully";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    EnvGate,
    Authorizing,
    DispatchPhi,
    ReconcileCache,
    Respond,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::EnvGate => "env_gate",
            Stage::Authorizing => "authorizing",
            Stage::DispatchPhi => "dispatch_phi",
            Stage::ReconcileCache => "reconcile_cache",
            Stage::Respond => "respond",
        }
    }
}

/// Caller identity as established by the edge auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

type StageResult<T> = Result<T, (Stage, ServiceError)>;

fn at(stage: Stage) -> impl FnOnce(ServiceError) -> (Stage, ServiceError) {
    move |err| (stage, err)
}

#[derive(Debug, Clone)]
pub struct PhiOrchestrator<D> {
    directory: D,
    broker: PhiBrokerClient,
    mode: PhiStoreMode,
}

impl<D: ClientDirectory> PhiOrchestrator<D> {
    pub fn new(directory: D, broker: PhiBrokerClient, mode: PhiStoreMode) -> Self {
        Self {
            directory,
            broker,
            mode,
        }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn broker(&self) -> &PhiBrokerClient {
        &self.broker
    }

    /// `PUT /clients/{id}/phi`. On success returns the response `data`
    /// object: the success message plus the applied fields.
    pub async fn update_client_phi(
        &self,
        raw_client_id: &str,
        identity: &Identity,
        body: &Value,
        request_id: &str,
    ) -> Result<PhiData, ServiceError> {
        let result = self
            .run_update(raw_client_id, identity, body, request_id)
            .await;

        match &result {
            Ok(_) => crate::metrics::observe_orchestrator_outcome(Stage::Respond.as_str(), "ok"),
            Err((stage, err)) => {
                crate::metrics::observe_orchestrator_outcome(stage.as_str(), err.code());
                tracing::info!(
                    stage = stage.as_str(),
                    code = err.code(),
                    "api.phi_update.rejected"
                );
            }
        }

        result.map_err(|(_, err)| err)
    }

    async fn run_update(
        &self,
        raw_client_id: &str,
        identity: &Identity,
        body: &Value,
        request_id: &str,
    ) -> StageResult<PhiData> {
        let client_id = parse_client_id(raw_client_id)
            .ok_or_else(invalid_client_id)
            .map_err(at(Stage::Validating))?;
        tracing::Span::current().record("client_id", tracing::field::display(client_id));
        let normalized = normalize_phi_input(body)
            .map_err(ServiceError::from)
            .map_err(at(Stage::Validating))?;
        let patch = PhiPatch::from_map(&normalized)
            .map_err(ServiceError::from)
            .map_err(at(Stage::Validating))?;

        self.require_primary().map_err(at(Stage::EnvGate))?;

        let exists = self
            .directory
            .client_exists(client_id)
            .await
            .map_err(directory_error)
            .map_err(at(Stage::Authorizing))?;
        if !exists {
            return Err((Stage::Authorizing, ServiceError::NotFound("Client not found")));
        }

        let requester = self
            .resolve_requester(identity)
            .await
            .map_err(at(Stage::Authorizing))?;
        if let Decision::Deny(_) = sokana_policy::decide(&requester, client_id, PhiAction::Write)
        {
            return Err((Stage::Authorizing, update_forbidden()));
        }

        let written = self
            .broker
            .update_phi(
                &PhiUpdateRequest {
                    client_id: client_id.to_string(),
                    requester,
                    fields: patch.to_wire(),
                },
                request_id,
            )
            .await
            .map_err(broker_error)
            .map_err(at(Stage::DispatchPhi))?;
        tracing::info!(
            fields = ?patch.field_names(),
            written = written.len(),
            "api.phi_update.dispatched"
        );

        self.reconcile_identity_cache(client_id, &patch).await;

        let mut data = PhiData::new();
        data.insert(
            "message".to_string(),
            Value::from(UPDATE_SUCCESS_MESSAGE),
        );
        data.extend(patch.to_wire());
        Ok(data)
    }

    /// The cache is a read optimization; a failed mirror leaves it stale
    /// until the next successful update and does not fail the request.
    async fn reconcile_identity_cache(&self, client_id: Uuid, patch: &PhiPatch) {
        let Some(update) = IdentityCacheUpdate::from_patch(patch) else {
            return;
        };

        match self
            .directory
            .update_identity_cache(client_id, &update)
            .await
        {
            Ok(()) => tracing::info!("api.phi_update.cache_reconciled"),
            Err(err) => {
                crate::metrics::observe_orchestrator_outcome(
                    Stage::ReconcileCache.as_str(),
                    "error",
                );
                tracing::warn!(error = %err, "api.phi_update.cache_reconcile_failed");
            }
        }
    }

    /// `GET /clients/{id}/phi`. Unauthorized callers get an empty object
    /// without the broker being asked.
    pub async fn read_client_phi(
        &self,
        raw_client_id: &str,
        identity: &Identity,
        request_id: &str,
    ) -> Result<PhiData, ServiceError> {
        let client_id = parse_client_id(raw_client_id).ok_or_else(invalid_client_id)?;
        self.require_primary()?;

        let requester = self.resolve_requester(identity).await?;
        match sokana_policy::decide(&requester, client_id, PhiAction::Read) {
            Decision::Allow => {}
            Decision::Deny(Denial::SilentEmpty) => return Ok(PhiData::new()),
            Decision::Deny(Denial::Forbidden) => return Err(update_forbidden()),
        }

        self.broker
            .fetch_phi(
                &PhiFetchRequest {
                    client_id: client_id.to_string(),
                    requester,
                },
                request_id,
            )
            .await
            .map_err(broker_error)
    }

    /// `GET /clients/{id}`. PHI keys (identity cache included) are removed
    /// unless the caller is authorized; in primary mode an authorized
    /// caller gets broker PHI in their place.
    pub async fn load_client_record(
        &self,
        raw_client_id: &str,
        identity: &Identity,
        request_id: &str,
    ) -> Result<PhiData, ServiceError> {
        let client_id = parse_client_id(raw_client_id).ok_or_else(invalid_client_id)?;

        let record = self
            .directory
            .load_client(client_id)
            .await
            .map_err(directory_error)?
            .ok_or(ServiceError::NotFound("Client not found"))?;

        let requester = self.resolve_requester(identity).await?;
        if !sokana_policy::is_authorized(&requester, client_id) {
            return Ok(strip_phi_from_operational(record));
        }

        match self.mode {
            PhiStoreMode::Shadow => Ok(record),
            PhiStoreMode::Primary => {
                let phi = self
                    .broker
                    .fetch_phi(
                        &PhiFetchRequest {
                            client_id: client_id.to_string(),
                            requester,
                        },
                        request_id,
                    )
                    .await
                    .map_err(broker_error)?;

                let mut merged = strip_phi_from_operational(record);
                merged.extend(phi);
                Ok(merged)
            }
        }
    }

    /// Assignments always come from the operational store, never from the
    /// caller.
    pub async fn resolve_requester(&self, identity: &Identity) -> Result<Requester, ServiceError> {
        let assigned_client_ids = match identity.role {
            Role::Doula => self
                .directory
                .assigned_client_ids(&identity.user_id)
                .await
                .map_err(directory_error)?,
            Role::Admin | Role::Other => Vec::new(),
        };

        Ok(Requester {
            role: identity.role,
            user_id: identity.user_id.clone(),
            assigned_client_ids,
        })
    }

    fn require_primary(&self) -> Result<(), ServiceError> {
        match self.mode {
            PhiStoreMode::Primary => Ok(()),
            PhiStoreMode::Shadow => Err(ServiceError::NotImplemented("Shadow disabled")),
        }
    }
}

fn invalid_client_id() -> ServiceError {
    ServiceError::Validation("Invalid client ID format".to_string())
}

fn update_forbidden() -> ServiceError {
    ServiceError::Authorization("Not authorized to update PHI for this client")
}

fn directory_error(err: DirectoryError) -> ServiceError {
    match err {
        DirectoryError::Unavailable | DirectoryError::Timeout => {
            ServiceError::Unavailable("Operational store unavailable")
        }
        DirectoryError::Query => ServiceError::Internal(err.to_string()),
    }
}

fn broker_error(err: BrokerError) -> ServiceError {
    match err {
        BrokerError::Rejected {
            status: 400,
            message,
            ..
        } => ServiceError::Validation(message.unwrap_or_else(|| "Invalid PHI update".to_string())),
        BrokerError::Rejected { status: 403, .. } => update_forbidden(),
        BrokerError::Rejected { status: 503, .. } => {
            ServiceError::Unavailable("PHI store unavailable")
        }
        BrokerError::Rejected { status, .. } => {
            tracing::warn!(status, "api.phi_broker.rejected");
            ServiceError::BadGateway("PHI broker error")
        }
        BrokerError::Timeout | BrokerError::Unreachable | BrokerError::InvalidResponse => {
            tracing::warn!(error = %err, "api.phi_broker.unavailable");
            ServiceError::BadGateway("PHI broker unavailable")
        }
    }
}
