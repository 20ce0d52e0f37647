use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::Method,
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::debug;

/// Bucket for requests that match no registered route.
pub const UNMATCHED_ENDPOINT: &str = "unmatched";

/// Counts requests, errors and latency per `METHOD /route-pattern`.
///
/// Keys come from the route table, never from the raw URL, so the number of
/// tracked endpoints stays fixed no matter what paths clients request.
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let endpoint = endpoint_key(&req);

        let app_state = req.app_data::<web::Data<AppState>>().cloned();
        if let Some(state) = &app_state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    response.status().is_client_error() || response.status().is_server_error()
                }
                Err(_) => true,
            };

            // Recorded even when the inner service failed outright
            if let Some(state) = app_state {
                state.record_endpoint_request(&endpoint, duration_ms, is_error);
                if is_error {
                    state.increment_error_count();
                }
            }

            debug!(endpoint = %endpoint, duration_ms, is_error, "Request finished");
            result
        })
    }
}

fn endpoint_key(req: &ServiceRequest) -> String {
    let Some(pattern) = req.match_pattern() else {
        return UNMATCHED_ENDPOINT.to_string();
    };

    let method = req.method();
    let known = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::HEAD,
        Method::OPTIONS,
        Method::PATCH,
    ];
    if known.contains(method) {
        format!("{} {}", method, pattern)
    } else {
        format!("OTHER {}", pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App, HttpResponse};

    #[actix_web::test]
    async fn test_records_success_and_errors() {
        let state = AppState::new(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/bad", web::get().to(|| async { HttpResponse::BadRequest().finish() })),
        )
        .await;

        test::call_service(&app, test::TestRequest::get().uri("/ok").to_request()).await;
        test::call_service(&app, test::TestRequest::get().uri("/bad").to_request()).await;
        test::call_service(&app, test::TestRequest::get().uri("/bad").to_request()).await;

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 3);
        assert_eq!(snapshot.error_count, 2);
        assert_eq!(snapshot.endpoint_metrics["GET /ok"].request_count, 1);
        assert_eq!(snapshot.endpoint_metrics["GET /bad"].error_rate(), 1.0);
    }

    #[actix_web::test]
    async fn test_unknown_paths_share_one_bucket() {
        let state = AppState::new(AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        for i in 0..500 {
            let uri = format!("/scan-{}", i);
            test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        }
        let request = test::TestRequest::default()
            .method(Method::from_bytes(b"PROPFIND").unwrap())
            .uri("/ok")
            .to_request();
        test::call_service(&app, request).await;

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.endpoint_metrics.len(), 2);
        assert_eq!(snapshot.endpoint_metrics[UNMATCHED_ENDPOINT].request_count, 500);
        assert_eq!(snapshot.endpoint_metrics[UNMATCHED_ENDPOINT].error_count, 500);
        assert_eq!(snapshot.endpoint_metrics["OTHER /ok"].request_count, 1);
    }
}
