use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use kameo::actor::ActorRef;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

use crate::actors::{GetSystemHealth, HealthMonitorActor, HealthStatus};

/// Serve `/metrics` (Prometheus text format) and `/health`.
pub async fn start_metrics_server(
    registry: Arc<Registry>,
    health: ActorRef<HealthMonitorActor>,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!("📊 Starting metrics server on http://0.0.0.0:{}/metrics", port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(health.clone()))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(registry: web::Data<Arc<Registry>>) -> impl Responder {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

async fn health_handler(health: web::Data<ActorRef<HealthMonitorActor>>) -> impl Responder {
    match health.ask(GetSystemHealth).await {
        Ok(report) if report.overall_status.is_unhealthy() => {
            HttpResponse::ServiceUnavailable().json(report)
        }
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => {
            tracing::error!(error = ?e, "Health monitor unreachable");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "overall_status": HealthStatus::Unhealthy("health monitor unreachable".to_string()),
                "service": "dc-replication",
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;

    use crate::actors::UpdateHealth;
    use crate::metrics::Metrics;

    #[actix::test]
    async fn test_health_endpoint_reflects_monitor() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let monitor = HealthMonitorActor::new(vec![], metrics.clone()).spawn_monitor();
        monitor
            .tell(UpdateHealth {
                component: "link:order@us".into(),
                status: HealthStatus::Unhealthy("peer down".into()),
                details: None,
            })
            .send()
            .await
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(Arc::new(metrics.registry().clone())))
                .app_data(web::Data::new(monitor))
                .route("/metrics", web::get().to(metrics_handler))
                .route("/health", web::get().to(health_handler)),
        )
        .await;

        let response = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);

        let response = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
        assert!(response.status().is_success());
        let body = test::read_body(response).await;
        assert!(String::from_utf8_lossy(&body).contains("health_status"));
    }
}
