//! Deployment lifecycle and artefact transfer.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use ftl_core::{DeploymentKey, Digest};
use ftl_schema::{ModuleRuntime, SchemaErrors, parse_module, validate_module_in_schema};
use ftl_state::{ClusterEvent, Deployment, DeploymentArtefact};
use ftl_timeline::{EventPayload, TimelineEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ControllerError, ControllerResult, deployment_not_found};
use crate::service::ControllerService;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeployment {
    /// The module in schema text form.
    pub schema: String,
    pub language: String,
    #[serde(default)]
    pub artefacts: Vec<DeploymentArtefact>,
}

/// Runtime facts reported for a deployment. Unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeUpdate {
    pub create_time: Option<DateTime<Utc>>,
    pub language: Option<String>,
    pub min_replicas: Option<u32>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtefactChunk {
    pub artefact: DeploymentArtefact,
    pub chunk: Vec<u8>,
}

impl ControllerService {
    pub fn create_deployment(&self, request: CreateDeployment) -> ControllerResult<DeploymentKey> {
        let parsed = parse_module("", &request.schema).map_err(SchemaErrors::from)?;
        let view = self.state.view();
        let module = validate_module_in_schema(&view.schema(), &parsed)?;

        let digests: Vec<Digest> = request.artefacts.iter().map(|a| a.digest).collect();
        let missing = self.state.store().missing_artefacts(&digests)?;
        if !missing.is_empty() {
            let missing: Vec<String> = missing.iter().map(ToString::to_string).collect();
            return Err(ControllerError::InvalidArgument(format!(
                "missing artefacts: {}",
                missing.join(", ")
            )));
        }
        let mut announced = BTreeSet::new();
        for digest in digests {
            if !view.artefacts.contains(&digest) && announced.insert(digest) {
                self.state
                    .publish(ClusterEvent::DeploymentArtefactCreated { digest })?;
            }
        }

        let key = DeploymentKey::new(&module.name);
        let now = self.clock.now();
        let mut schema = module;
        schema.runtime = Some(ModuleRuntime {
            create_time: Some(now),
            language: request.language.clone(),
            deployment: Some(key.to_string()),
            ..schema.runtime.unwrap_or_default()
        });
        let deployment = Deployment {
            key: key.clone(),
            module: schema.name.clone(),
            schema,
            language: request.language,
            artefacts: request.artefacts,
            created_at: now,
            activated_at: None,
            min_replicas: 0,
        };
        self.state.publish(ClusterEvent::DeploymentCreated {
            deployment: Box::new(deployment),
        })?;
        info!(deployment = %key, "deployment created");
        Ok(key)
    }

    pub fn get_deployment(&self, key: &DeploymentKey) -> ControllerResult<Deployment> {
        self.state
            .view()
            .deployment(key)
            .cloned()
            .ok_or_else(|| deployment_not_found(key))
    }

    /// Change a deployment's replica count. Going from zero replicas to some
    /// activates it in place of the module's current deployment; going to
    /// zero deactivates it and removes the module.
    pub fn update_deploy(&self, key: &DeploymentKey, min_replicas: Option<u32>) -> ControllerResult<()> {
        let Some(min_replicas) = min_replicas else {
            return Ok(());
        };
        let now = self.clock.now();
        let (module, prev) = self.state.publish_with(|view| {
            let deployment = view.deployment(key).ok_or_else(|| deployment_not_found(key))?;
            let prev = deployment.min_replicas;
            let mut events = vec![ClusterEvent::DeploymentReplicasUpdated {
                key: key.clone(),
                min_replicas,
            }];
            if prev == 0 && min_replicas > 0 {
                events.push(ClusterEvent::DeploymentActivated {
                    key: key.clone(),
                    activated_at: now,
                    min_replicas,
                });
                if let Some(displaced) = view
                    .active_deployment(&deployment.module)
                    .filter(|active| active.key != *key)
                {
                    events.push(ClusterEvent::DeploymentDeactivated {
                        key: displaced.key.clone(),
                        module_removed: false,
                    });
                }
            } else if prev > 0 && min_replicas == 0 {
                events.push(ClusterEvent::DeploymentDeactivated {
                    key: key.clone(),
                    module_removed: true,
                });
            }
            Ok::<_, ControllerError>((events, (deployment.module.clone(), prev)))
        })?;
        if prev == 0 && min_replicas > 0 {
            info!(deployment = %key, min_replicas, "deployment activated");
        } else if prev > 0 && min_replicas == 0 {
            info!(deployment = %key, "deployment deactivated");
        }

        self.timeline.publish(
            TimelineEvent::new(EventPayload::DeploymentUpdated {
                module,
                min_replicas,
                prev_min_replicas: prev,
            })
            .at(now)
            .deployment(key.clone()),
        );
        Ok(())
    }

    /// Activate `key` and retire whatever deployment of the same module was
    /// active before it.
    pub fn replace_deploy(&self, key: &DeploymentKey, min_replicas: u32) -> ControllerResult<()> {
        if min_replicas == 0 {
            return Err(ControllerError::InvalidArgument(
                "min replicas must be greater than zero".into(),
            ));
        }
        let now = self.clock.now();
        let (deployment, replaced) = self.state.publish_with(|view| {
            let deployment = view.deployment(key).ok_or_else(|| deployment_not_found(key))?;
            let replaced = view.active_deployment(&deployment.module).map(|d| d.key.clone());
            if replaced.as_ref() == Some(key) {
                return Err(ControllerError::AlreadyActive(key.clone()));
            }
            let mut events = vec![ClusterEvent::DeploymentActivated {
                key: key.clone(),
                activated_at: now,
                min_replicas,
            }];
            if let Some(old) = &replaced {
                events.push(ClusterEvent::DeploymentDeactivated {
                    key: old.clone(),
                    module_removed: false,
                });
            }
            Ok::<_, ControllerError>((events, (deployment.clone(), replaced)))
        })?;
        info!(deployment = %key, replaced = ?replaced.as_ref().map(ToString::to_string), "deployment replaced");

        self.timeline.publish(
            TimelineEvent::new(EventPayload::DeploymentCreated {
                module: deployment.module.clone(),
                language: deployment.language.clone(),
                min_replicas,
                replaced,
            })
            .at(now)
            .deployment(key.clone()),
        );
        Ok(())
    }

    pub fn update_deployment_runtime(
        &self,
        key: &DeploymentKey,
        update: RuntimeUpdate,
    ) -> ControllerResult<()> {
        let view = self.state.view();
        let deployment = view.deployment(key).ok_or_else(|| deployment_not_found(key))?;
        let mut schema = deployment.schema.clone();
        let runtime = schema.runtime.get_or_insert_with(ModuleRuntime::default);
        if let Some(create_time) = update.create_time {
            runtime.create_time = Some(create_time);
        }
        if let Some(language) = update.language {
            runtime.language = language;
        }
        if let Some(min_replicas) = update.min_replicas {
            runtime.min_replicas = min_replicas;
        }
        if let Some(endpoint) = update.endpoint {
            runtime.endpoint = Some(endpoint);
        }
        runtime.deployment = Some(key.to_string());
        self.state.publish(ClusterEvent::DeploymentSchemaUpdated {
            key: key.clone(),
            schema: Box::new(schema),
        })?;
        debug!(deployment = %key, "deployment runtime updated");
        Ok(())
    }

    // ── Artefacts ──────────────────────────────────────────────────

    pub fn upload_artefact(&self, content: &[u8]) -> ControllerResult<Digest> {
        let digest = self.state.store().put_artefact(content)?;
        if !self.state.view().artefacts.contains(&digest) {
            self.state
                .publish(ClusterEvent::DeploymentArtefactCreated { digest })?;
        }
        debug!(%digest, size = content.len(), "artefact uploaded");
        Ok(digest)
    }

    /// The digests the store does not have.
    pub fn get_artefact_diffs(&self, digests: &[Digest]) -> ControllerResult<Vec<Digest>> {
        Ok(self.state.store().missing_artefacts(digests)?)
    }

    /// The deployment's artefacts, minus those in `have`, cut into chunks
    /// of the configured size. Empty artefacts yield one empty chunk.
    pub fn get_deployment_artefacts(
        &self,
        key: &DeploymentKey,
        have: &BTreeSet<Digest>,
    ) -> ControllerResult<Vec<ArtefactChunk>> {
        let deployment = self.get_deployment(key)?;
        let chunk_size = self.config.artefact_chunk_size.max(1);
        let mut chunks = Vec::new();
        for artefact in deployment.artefacts.into_iter().filter(|a| !have.contains(&a.digest)) {
            let content = self
                .state
                .store()
                .get_artefact(&artefact.digest)?
                .ok_or_else(|| {
                    ControllerError::NotFound(format!("artefact {} not found", artefact.digest))
                })?;
            if content.is_empty() {
                chunks.push(ArtefactChunk {
                    artefact,
                    chunk: Vec::new(),
                });
                continue;
            }
            for piece in content.chunks(chunk_size) {
                chunks.push(ArtefactChunk {
                    artefact: artefact.clone(),
                    chunk: piece.to_vec(),
                });
            }
        }
        Ok(chunks)
    }
}
