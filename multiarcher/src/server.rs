use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::{self, Json, WithStatus};
use warp::{Filter, Rejection, Reply};

use crate::admission::AdmissionEngine;
use crate::config::{ServerSettings, TlsSettings};
use crate::error::{Error, Result};

fn error_reply(message: &str, status: StatusCode) -> WithStatus<Json> {
    reply::with_status(reply::json(&json!({ "error": message })), status)
}

async fn mutate_handler(
    body: Bytes,
    engine: Arc<AdmissionEngine>,
    request_timeout: Duration,
) -> std::result::Result<WithStatus<Json>, Infallible> {
    match tokio::time::timeout(request_timeout, engine.process(&body)).await {
        Ok(Ok(review)) => Ok(reply::with_status(reply::json(&review), StatusCode::OK)),
        // already logged by the engine
        Ok(Err(_)) => Ok(error_reply("internal server error", StatusCode::INTERNAL_SERVER_ERROR)),
        Err(_) => {
            error!(timeout = ?request_timeout, "admission review timed out");
            Ok(error_reply("internal server error", StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

async fn recover(err: Rejection) -> std::result::Result<WithStatus<Json>, Infallible> {
    if err.is_not_found() {
        return Ok(error_reply("not found", StatusCode::NOT_FOUND));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(error_reply("method not allowed", StatusCode::METHOD_NOT_ALLOWED));
    }

    error!(rejection = ?err, "failed to read request body");
    Ok(error_reply("invalid request body", StatusCode::BAD_REQUEST))
}

/// Webhook routes: `POST /mutate`, `GET /healthz` and `GET /livez`
pub fn routes(
    engine: Arc<AdmissionEngine>,
    request_timeout: Duration,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let mutate = warp::path("mutate")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::bytes())
        .and(warp::any().map(move || engine.clone()))
        .and(warp::any().map(move || request_timeout))
        .and_then(mutate_handler);

    let health = warp::path("healthz")
        .or(warp::path("livez"))
        .unify()
        .and(warp::path::end())
        .and(warp::get())
        .map(|| reply::json(&json!({ "status": "ok" })));

    mutate
        .or(health)
        .recover(recover)
        .with(warp::trace::request())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| Error::Config(format!("listen address {addr} did not resolve")))
}

// warp panics on unreadable TLS material, so it is checked up front
async fn check_tls_files(tls: &TlsSettings) -> Result<()> {
    for (what, path) in [("certificate", &tls.cert_path), ("key", &tls.key_path)] {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|err| Error::Config(format!("failed to read tls {what} {path}: {err}")))?;
        if contents.is_empty() {
            return Err(Error::Config(format!("tls {what} {path} is empty")));
        }
    }
    Ok(())
}

/// Serves the webhook until a shutdown signal arrives
pub async fn serve(engine: Arc<AdmissionEngine>, settings: &ServerSettings) -> Result<()> {
    if let Some(tls) = &settings.tls {
        check_tls_files(tls).await?;
    }

    let addr = resolve(&settings.addr()).await?;
    let routes = routes(engine, settings.request_timeout);

    match &settings.tls {
        Some(tls) => {
            let (addr, server) = warp::serve(routes)
                .tls()
                .cert_path(&tls.cert_path)
                .key_path(&tls.key_path)
                .bind_with_graceful_shutdown(addr, shutdown_signal());
            info!(%addr, cert = %tls.cert_path, "starting webhook server with tls");
            server.await;
        }
        None => {
            let (addr, server) = warp::serve(routes)
                .try_bind_with_graceful_shutdown(addr, shutdown_signal())
                .map_err(|err| Error::Config(format!("failed to bind {addr}: {err}")))?;
            info!(%addr, "starting webhook server");
            server.await;
        }
    }

    info!("webhook server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::cache::AdaptiveCache;
    use crate::checker::tests::StaticInspector;
    use crate::cluster::ClusterAccess;
    use crate::config::PlatformTolerationConfig;
    use crate::error::InspectError;
    use crate::filter::NamespaceFilter;
    use crate::registry::{ManifestInspector, RegistryHost};

    struct HangingInspector;

    #[async_trait]
    impl ManifestInspector for HangingInspector {
        async fn platforms(
            &self,
            _image: &str,
            _hosts: &[RegistryHost],
        ) -> std::result::Result<Vec<String>, InspectError> {
            std::future::pending().await
        }
    }

    fn engine(inspector: Arc<dyn ManifestInspector>) -> Arc<AdmissionEngine> {
        Arc::new(AdmissionEngine::new(
            Arc::new(PlatformTolerationConfig::default()),
            NamespaceFilter::default(),
            ClusterAccess::Unavailable("test".into()),
            Arc::new(AdaptiveCache::new(10)),
            inspector,
        ))
    }

    fn review() -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "server-uid",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "web",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {},
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "web", "namespace": "default"},
                    "spec": {"containers": [{"name": "web", "image": "nginx"}]}
                }
            }
        })
    }

    #[tokio::test]
    async fn test_health_routes() {
        let routes = routes(engine(Arc::new(StaticInspector::default())), Duration::from_secs(5));

        for path in ["/healthz", "/livez"] {
            let res = warp::test::request().path(path).reply(&routes).await;
            assert_eq!(res.status(), StatusCode::OK);
            let body: Value = serde_json::from_slice(res.body()).unwrap();
            assert_eq!(body, json!({ "status": "ok" }));
        }

        let res = warp::test::request().path("/unknown").reply(&routes).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mutate_returns_review() {
        let inspector = StaticInspector::default().with_image("nginx", &["linux/arm64"]);
        let routes = routes(engine(Arc::new(inspector)), Duration::from_secs(5));

        let res = warp::test::request()
            .method("POST")
            .path("/mutate")
            .body(review().to_string())
            .reply(&routes)
            .await;

        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["response"]["uid"], "server-uid");
        assert_eq!(body["response"]["allowed"], true);
        assert_eq!(body["response"]["patchType"], "JSONPatch");
    }

    #[tokio::test]
    async fn test_mutate_engine_error_is_500() {
        let routes = routes(engine(Arc::new(StaticInspector::default())), Duration::from_secs(5));

        let res = warp::test::request()
            .method("POST")
            .path("/mutate")
            .body("{not json")
            .reply(&routes)
            .await;

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body, json!({ "error": "internal server error" }));
    }

    #[tokio::test]
    async fn test_mutate_requires_post() {
        let routes = routes(engine(Arc::new(StaticInspector::default())), Duration::from_secs(5));

        let res = warp::test::request().method("GET").path("/mutate").reply(&routes).await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_serve_rejects_unreadable_tls_files() {
        let manifest = concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml").to_owned();
        let missing = concat!(env!("CARGO_MANIFEST_DIR"), "/certs/missing.pem").to_owned();

        let cases = [
            (missing.clone(), manifest.clone(), "certificate"),
            (manifest, missing, "key"),
        ];
        for (cert_path, key_path, what) in cases {
            let settings = ServerSettings {
                host: "127.0.0.1".into(),
                port: 0,
                tls: Some(TlsSettings { cert_path, key_path }),
                request_timeout: Duration::from_secs(5),
            };

            let err = serve(engine(Arc::new(StaticInspector::default())), &settings)
                .await
                .unwrap_err();
            assert!(
                matches!(&err, Error::Config(msg) if msg.contains(what)),
                "unexpected error {err}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_deadline() {
        let routes = routes(engine(Arc::new(HangingInspector)), Duration::from_secs(1));

        let res = warp::test::request()
            .method("POST")
            .path("/mutate")
            .body(review().to_string())
            .reply(&routes)
            .await;

        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
