use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::reply::{Reply, ReplyError};
use kameo::Actor;
use serde::Serialize;

use crate::actors::core::{ComponentHealth, HealthStatus};
use crate::metrics::Metrics;
use crate::utils::CircuitBreaker;

// ============================================================================
// Health Monitor Actor
// ============================================================================
//
// Responsibilities:
// 1. Keep the last reported status of every component
// 2. Poll the peer circuit breakers on an interval
// 3. Fold component statuses into the system status (and its gauge)
//
// ============================================================================

#[derive(Debug)]
pub struct UpdateHealth {
    pub component: String,
    pub status: HealthStatus,
    pub details: Option<String>,
}

#[derive(Debug)]
pub struct GetSystemHealth;

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub check_time: chrono::DateTime<Utc>,
}

impl Reply for SystemHealth {
    type Ok = Self;
    type Error = Infallible;
    type Value = Self;

    fn to_result(self) -> Result<Self, Infallible> {
        Ok(self)
    }

    fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
        None
    }

    fn into_value(self) -> Self::Value {
        self
    }
}

pub struct HealthMonitorActor {
    components: HashMap<String, ComponentHealth>,
    breakers: Vec<CircuitBreaker>,
    poll_interval: Duration,
    metrics: Arc<Metrics>,
}

impl HealthMonitorActor {
    pub fn new(breakers: Vec<CircuitBreaker>, metrics: Arc<Metrics>) -> Self {
        Self {
            components: HashMap::new(),
            breakers,
            poll_interval: Duration::from_secs(10),
            metrics,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawn the monitor on the current runtime.
    pub fn spawn_monitor(self) -> ActorRef<Self> {
        use kameo::prelude::*;
        HealthMonitorActor::spawn(self)
    }

    fn compute_overall_status(&self) -> HealthStatus {
        let mut degraded = false;
        let mut unhealthy = Vec::new();

        for (name, health) in &self.components {
            match &health.status {
                HealthStatus::Unhealthy(reason) => unhealthy.push(format!("{name}: {reason}")),
                HealthStatus::Degraded(_) => degraded = true,
                HealthStatus::Healthy => {}
            }
        }

        if !unhealthy.is_empty() {
            unhealthy.sort();
            HealthStatus::Unhealthy(unhealthy.join(", "))
        } else if degraded {
            HealthStatus::Degraded("some components degraded".to_string())
        } else {
            HealthStatus::Healthy
        }
    }
}

impl Actor for HealthMonitorActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!(breakers = state.breakers.len(), "🩺 HealthMonitorActor started");

        let breakers = state.breakers.clone();
        let poll_interval = state.poll_interval;
        let monitor = actor_ref.downgrade();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    return;
                };
                for breaker in &breakers {
                    let status = HealthStatus::from(breaker.get_state().await);
                    let _ = monitor
                        .tell(UpdateHealth {
                            component: format!("peer:{}", breaker.name()),
                            status,
                            details: Some(format!("{} recent failures", breaker.get_failure_count().await)),
                        })
                        .send()
                        .await;
                }
            }
        });

        Ok(state)
    }
}

impl Message<UpdateHealth> for HealthMonitorActor {
    type Reply = ();

    async fn handle(&mut self, msg: UpdateHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let previous = self.components.get(&msg.component).map(|c| c.status.clone());
        if previous.as_ref() != Some(&msg.status) {
            tracing::info!(component = %msg.component, status = ?msg.status, "Component health changed");
        }

        let health = ComponentHealth::new(msg.component.clone(), msg.status).with_details(msg.details);
        self.components.insert(msg.component, health);
        self.metrics.health_status.set(self.compute_overall_status().gauge());
    }
}

impl Message<GetSystemHealth> for HealthMonitorActor {
    type Reply = SystemHealth;

    async fn handle(&mut self, _msg: GetSystemHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        SystemHealth {
            overall_status: self.compute_overall_status(),
            components: self.components.clone(),
            check_time: Utc::now(),
        }
    }
}
