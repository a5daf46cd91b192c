//! Runner registration, log intake and the stale runner reaper.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use ftl_core::{DeploymentKey, RequestKey, RunnerKey};
use ftl_scheduler::{Backoff, JobHandle, Scheduler};
use ftl_state::{ClusterEvent, Runner};
use ftl_timeline::{EventPayload, LogLevel, TimelineEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ControllerError, ControllerResult, deployment_not_found};
use crate::service::{ControllerService, parse_deployment_key};

/// Sent by a runner on its registration stream, once on start and then
/// periodically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub key: String,
    pub endpoint: String,
    pub deployment: String,
}

/// One log line forwarded by a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub deployment: String,
    pub request_key: Option<String>,
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl ControllerService {
    /// Register a runner for as long as its heartbeat stream stays open.
    /// Every heartbeat refreshes the runner; when the stream ends, fails or
    /// carries an invalid heartbeat the runner is deleted once.
    pub async fn register_runner<S, E>(&self, heartbeats: S) -> ControllerResult<()>
    where
        S: Stream<Item = Result<Heartbeat, E>>,
        E: Display,
    {
        let mut heartbeats = std::pin::pin!(heartbeats);
        let mut registered: Option<RunnerKey> = None;
        let outcome = async {
            while let Some(heartbeat) = heartbeats.next().await {
                let heartbeat = heartbeat.map_err(|e| {
                    ControllerError::InvalidArgument(format!("runner stream failed: {e}"))
                })?;
                let key = self.heartbeat(&heartbeat, registered.as_ref())?;
                if registered.is_none() {
                    info!(runner = %key, endpoint = %heartbeat.endpoint, "runner registered");
                    registered = Some(key);
                }
            }
            Ok(())
        }
        .await;

        if let Some(key) = registered {
            if let Err(e) = self.state.publish(ClusterEvent::RunnerDeleted { key: key.clone() }) {
                warn!(runner = %key, error = %e, "failed to delete runner");
            }
            info!(runner = %key, "runner disconnected");
        }
        outcome
    }

    fn heartbeat(
        &self,
        heartbeat: &Heartbeat,
        registered: Option<&RunnerKey>,
    ) -> ControllerResult<RunnerKey> {
        let endpoint = Url::parse(&heartbeat.endpoint).map_err(|e| {
            ControllerError::InvalidArgument(format!("invalid endpoint {:?}: {e}", heartbeat.endpoint))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ControllerError::InvalidArgument(format!(
                "invalid endpoint scheme {:?}",
                endpoint.scheme()
            )));
        }
        let key = RunnerKey::parse(&heartbeat.key)
            .map_err(|e| ControllerError::InvalidArgument(format!("invalid runner key: {e}")))?;
        if let Some(registered) = registered {
            if *registered != key {
                return Err(ControllerError::InvalidArgument(format!(
                    "runner key changed from {registered} to {key}"
                )));
            }
        }
        let deployment = parse_deployment_key(&heartbeat.deployment)?;
        if self.state.view().deployment(&deployment).is_none() {
            return Err(deployment_not_found(&deployment));
        }

        let now = self.clock.now();
        self.state.publish(ClusterEvent::RunnerRegistered {
            runner: Runner {
                key: key.clone(),
                endpoint: heartbeat.endpoint.clone(),
                module: deployment.module().to_string(),
                deployment,
                created_at: now,
                last_seen: now,
            },
        })?;
        debug!(runner = %key, "heartbeat");
        Ok(key)
    }

    /// Delete runners that have not sent a heartbeat within the runner
    /// timeout. Returns how many were reaped.
    pub fn reap_stale_runners(&self) -> ControllerResult<usize> {
        let now = self.clock.now();
        let stale = self
            .state
            .view()
            .stale_runners(now, self.config.runner_timeout);
        for key in &stale {
            self.state
                .publish(ClusterEvent::RunnerDeleted { key: key.clone() })?;
            warn!(runner = %key, "reaped stale runner");
        }
        Ok(stale.len())
    }

    /// Run the reaper every runner timeout on whichever controller holds
    /// its lease.
    pub fn schedule_reaper(&self, scheduler: &Scheduler) -> JobHandle {
        let period = self.config.runner_timeout.max(Duration::from_millis(100));
        let service = self.clone();
        scheduler.singleton("reap-stale-runners", Backoff::new(period, period), move || {
            let service = service.clone();
            async move {
                service.reap_stale_runners()?;
                Ok(period)
            }
        })
    }

    /// Turn runner log lines into timeline log events. Stops at the first
    /// malformed line.
    pub async fn stream_deployment_logs<S, E>(&self, lines: S) -> ControllerResult<usize>
    where
        S: Stream<Item = Result<LogLine, E>>,
        E: Display,
    {
        let mut lines = std::pin::pin!(lines);
        let mut count = 0;
        while let Some(line) = lines.next().await {
            let line = line
                .map_err(|e| ControllerError::InvalidArgument(format!("log stream failed: {e}")))?;
            let deployment: DeploymentKey = parse_deployment_key(&line.deployment)?;
            let request_key = line
                .request_key
                .as_deref()
                .map(RequestKey::parse)
                .transpose()
                .map_err(|e| ControllerError::InvalidArgument(format!("invalid request key: {e}")))?;
            self.timeline.publish(
                TimelineEvent::new(EventPayload::Log {
                    level: line.level,
                    message: line.message,
                    attributes: line.attributes,
                    error: line.error,
                })
                .at(line.time)
                .deployment(deployment)
                .request(request_key),
            );
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use ftl_core::{Clock, Code, ErrorCode};
    use ftl_timeline::{EventType, TimelineFilter, TimelineQuery};
    use futures_util::stream;

    use super::*;
    use crate::deployments::CreateDeployment;
    use crate::service::testing::{Harness, harness};

    fn deploy(h: &Harness) -> DeploymentKey {
        h.service
            .create_deployment(CreateDeployment {
                schema: "module echo {\n  export verb echo(Unit) String\n}\n".to_string(),
                language: "go".to_string(),
                artefacts: Vec::new(),
            })
            .unwrap()
    }

    fn heartbeat(runner: &RunnerKey, deployment: &DeploymentKey, endpoint: &str) -> Heartbeat {
        Heartbeat {
            key: runner.to_string(),
            endpoint: endpoint.to_string(),
            deployment: deployment.to_string(),
        }
    }

    #[tokio::test]
    async fn runners_live_as_long_as_their_stream() {
        let h = harness();
        let deployment = deploy(&h);
        let runner = RunnerKey::new("10.0.0.1", 8893);
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Heartbeat, Infallible>>(4);

        let service = h.service.clone();
        let task = tokio::spawn(async move {
            service.register_runner(receiver_stream(rx)).await
        });
        tx.send(Ok(heartbeat(&runner, &deployment, "http://10.0.0.1:8893")))
            .await
            .unwrap();
        while h.service.state().view().runners.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.service.status().runners[0].key, runner);

        let mut events = h.service.state().subscribe();
        drop(tx);
        task.await.unwrap().unwrap();
        assert!(h.service.state().view().runners.is_empty());
        assert!(matches!(
            events.recv().await,
            Some(ClusterEvent::RunnerDeleted { key }) if key == runner
        ));
    }

    fn receiver_stream<T>(rx: tokio::sync::mpsc::Receiver<T>) -> impl Stream<Item = T> {
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
    }

    #[tokio::test]
    async fn invalid_heartbeats_end_the_registration() {
        let h = harness();
        let deployment = deploy(&h);
        let runner = RunnerKey::new("10.0.0.1", 8893);

        let err = h
            .service
            .register_runner(stream::iter([Ok::<_, Infallible>(heartbeat(
                &runner,
                &deployment,
                "ftp://10.0.0.1:8893",
            ))]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid endpoint scheme \"ftp\"");

        let err = h
            .service
            .register_runner(stream::iter([Ok::<_, Infallible>(heartbeat(
                &runner,
                &DeploymentKey::new("ghost"),
                "http://10.0.0.1:8893",
            ))]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        // A registered runner is deleted when a later heartbeat is bad.
        let good = heartbeat(&runner, &deployment, "http://10.0.0.1:8893");
        let mut bad = good.clone();
        bad.key = "nonsense".to_string();
        let err = h
            .service
            .register_runner(stream::iter([Ok::<_, Infallible>(good), Ok(bad)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(h.service.state().view().runners.is_empty());
    }

    #[tokio::test]
    async fn repeated_heartbeats_only_refresh_last_seen() {
        let h = harness();
        let deployment = deploy(&h);
        let runner = RunnerKey::new("10.0.0.1", 8893);
        let beat = heartbeat(&runner, &deployment, "http://10.0.0.1:8893");

        h.service.heartbeat(&beat, None).unwrap();
        let first = h.service.state().view().runners[&runner].clone();
        h.clock.advance(Duration::from_secs(3));
        h.service.heartbeat(&beat, Some(&runner)).unwrap();
        let second = h.service.state().view().runners[&runner].clone();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.last_seen - first.last_seen, chrono::Duration::seconds(3));
    }

    #[tokio::test]
    async fn stale_runners_are_reaped() {
        let h = harness();
        let deployment = deploy(&h);
        let runner = RunnerKey::new("10.0.0.1", 8893);
        h.service
            .heartbeat(&heartbeat(&runner, &deployment, "http://10.0.0.1:8893"), None)
            .unwrap();

        h.clock.advance(Duration::from_secs(10));
        assert_eq!(h.service.reap_stale_runners().unwrap(), 0);
        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.service.reap_stale_runners().unwrap(), 1);
        assert!(h.service.status().runners.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn log_lines_become_timeline_events() {
        let h = harness();
        let deployment = deploy(&h);
        let request = RequestKey::new(ftl_core::Origin::Ingress, "GET /echo");
        let line = LogLine {
            deployment: deployment.to_string(),
            request_key: Some(request.to_string()),
            time: h.clock.now(),
            level: LogLevel::Info,
            message: "hello".to_string(),
            attributes: BTreeMap::new(),
            error: None,
        };
        let count = h
            .service
            .stream_deployment_logs(stream::iter([Ok::<_, Infallible>(line)]))
            .await
            .unwrap();
        assert_eq!(count, 1);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let events = h
            .timeline
            .get_timeline(&TimelineQuery::new(10).filter(TimelineFilter::Types {
                types: vec![EventType::Log],
            }))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].deployment.as_ref(), Some(&deployment));
        assert_eq!(events[0].request_key.as_ref(), Some(&request));

        let bad = LogLine {
            deployment: "garbage".to_string(),
            request_key: None,
            time: h.clock.now(),
            level: LogLevel::Info,
            message: "x".to_string(),
            attributes: BTreeMap::new(),
            error: None,
        };
        let err = h
            .service
            .stream_deployment_logs(stream::iter([Ok::<_, Infallible>(bad)]))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid deployment key: "), "{err}");
    }
}
