use serde_json::{Value, json};
use std::sync::Arc;

use super::auth::Authorizer;
use super::protocol::{DossierPatch, Envelope, NewDossier, PONG, RpcCall, RpcRequest};
use crate::error::{ClusterError, Result};
use crate::membership::events::{EventPublisher, MembershipEvent};
use crate::store::types::{DEFAULT_KIND, Dossier, FormatSpec, Group, MembershipStatus};
use crate::store::NodeStore;

/// Per-call values. Lives only for the duration of one request.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub event_id: String,
    pub method: String,
    /// Known once the call has parsed.
    pub group: Option<Group>,
    pub id: Option<String>,
}

impl CallContext {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().simple().to_string(),
            method: method.into(),
            group: None,
            id: None,
        }
    }

    pub fn set_target(&mut self, call: &RpcCall) {
        let (group, id) = call.target();
        self.group = group;
        self.id = id.map(str::to_string);
    }

    /// `group/id` as far as known, `-` otherwise.
    pub fn target(&self) -> String {
        match (self.group, self.id.as_deref()) {
            (Some(group), Some(id)) => format!("{}/{}", group, id),
            (Some(group), None) => group.to_string(),
            (None, _) => "-".to_string(),
        }
    }
}

/// Applies remote calls to the node store.
pub struct RpcService {
    store: Arc<NodeStore>,
    authorizer: Arc<dyn Authorizer>,
    events: EventPublisher,
}

impl RpcService {
    pub fn new(
        store: Arc<NodeStore>,
        authorizer: Arc<dyn Authorizer>,
        events: EventPublisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            authorizer,
            events,
        })
    }

    /// Parses, validates, authorizes and executes one request.
    ///
    /// Always produces an envelope; failures are reported through `retcode`.
    pub async fn handle(&self, request: RpcRequest) -> Envelope {
        let mut ctx = CallContext::new(request.method.clone());
        tracing::debug!(
            "[{}][{}] Incoming call, params: {}",
            ctx.event_id,
            ctx.method,
            redact_key(&request)
        );

        let result = match RpcCall::parse(&request) {
            Ok(call) => {
                ctx.set_target(&call);
                self.execute(&ctx, call).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(data) => Envelope::ok(&ctx.event_id, data),
            Err(e) => {
                if e.retcode() == 2 {
                    tracing::warn!("[{}][{}] Rejected: {}", ctx.event_id, ctx.method, e);
                } else {
                    tracing::error!(
                        "[{}][{}] Failed on {}: {}",
                        ctx.event_id,
                        ctx.method,
                        ctx.target(),
                        e
                    );
                }
                Envelope::from_error(&ctx.event_id, &e)
            }
        }
    }

    /// Authorizes (where required) and runs a parsed call.
    pub async fn execute(&self, ctx: &CallContext, call: RpcCall) -> Result<Value> {
        if let Some(key) = call.auth_key()
            && !self.authorizer.verify(key, &ctx.event_id)
        {
            return Err(ClusterError::Authorization);
        }

        match call {
            RpcCall::Ping => Ok(Value::String(PONG.to_string())),
            RpcCall::Register { descriptor } => self.register(ctx, descriptor).await,
            RpcCall::GetDossier {
                group, format, id, ..
            } => self.get_dossier(ctx, group, &format, id.as_deref()).await,
            RpcCall::AddDossier { group, fields, .. } => {
                self.add_dossier(ctx, group, fields).await
            }
            RpcCall::UpdateDossier {
                group, id, patch, ..
            } => self.update_dossier(ctx, group, &id, patch).await,
            RpcCall::DeleteDossier { group, id, .. } => {
                self.delete_dossier(ctx, group, &id).await
            }
        }
    }

    /// Responder side of the handshake: store the initiator, answer with self.
    async fn register(&self, ctx: &CallContext, mut descriptor: Dossier) -> Result<Value> {
        let me = self.store.self_descriptor().await?;
        if descriptor.id == me.id {
            return Err(ClusterError::validation("refusing to register with self"));
        }

        tracing::info!(
            "[{}] Registration request from {} at {}",
            ctx.event_id,
            descriptor.id,
            descriptor.address()
        );

        // The initiator just reached us; its own scheduler finishes the exchange.
        descriptor.status = MembershipStatus::Active;
        let replaced = self.store.supersede(Group::Nodes, None, descriptor).await?;
        if replaced > 0 {
            tracing::debug!("[{}] Replaced {} earlier entries", ctx.event_id, replaced);
        }

        Ok(json!({ "ACK": me }))
    }

    async fn get_dossier(
        &self,
        ctx: &CallContext,
        group: Group,
        format: &FormatSpec,
        id: Option<&str>,
    ) -> Result<Value> {
        let data = match id {
            Some(id) => match self.store.find_by_id(group, id).await? {
                Some(record) => record.project(format)?,
                None => {
                    tracing::debug!("[{}] No {} entry with id {}", ctx.event_id, group, id);
                    Value::Null
                }
            },
            None => Value::Array(self.store.load_all(group, format).await?),
        };

        self.events.publish(MembershipEvent::StatusCheck {
            event_id: ctx.event_id.clone(),
        });
        Ok(data)
    }

    async fn add_dossier(&self, ctx: &CallContext, group: Group, fields: NewDossier) -> Result<Value> {
        let mut record = Dossier::new_peer(fields.host, fields.port);
        record.kind = fields.kind.unwrap_or_else(|| DEFAULT_KIND.to_string());
        record.route = fields.route.unwrap_or_default();

        self.store.upsert(group, record.clone()).await?;
        tracing::info!(
            "[{}] Created new host with ID {} at {}",
            ctx.event_id,
            record.id,
            record.address()
        );

        serde_json::to_value(&record).map_err(|e| ClusterError::Internal(e.to_string()))
    }

    async fn update_dossier(
        &self,
        ctx: &CallContext,
        group: Group,
        id: &str,
        patch: DossierPatch,
    ) -> Result<Value> {
        let changed = self
            .store
            .update_by_id(group, id, |record| {
                patch.apply(record);
                Ok(())
            })
            .await?;
        tracing::info!(
            "[{}] Update of {} in '{}': {}",
            ctx.event_id,
            id,
            group,
            if changed { "applied" } else { "no such id" }
        );

        Ok(json!({ "id": id, "changed": changed }))
    }

    async fn delete_dossier(&self, ctx: &CallContext, group: Group, id: &str) -> Result<Value> {
        let changed = self.store.remove_by_id(group, id).await?;
        tracing::info!(
            "[{}] Delete of {} in '{}': {}",
            ctx.event_id,
            id,
            group,
            if changed { "removed" } else { "no such id" }
        );

        Ok(json!({ "id": id, "changed": changed }))
    }
}

fn redact_key(request: &RpcRequest) -> Value {
    let mut params = request.params.clone();
    if params.contains_key("key") {
        params.insert("key".to_string(), Value::String("***".to_string()));
    }
    Value::Object(params)
}
