use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use http::{Method, Response, StatusCode};
use matchit::{Match, Router};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{
    config::Control,
    core::{CacheError, CacheResult},
    intercept::CacheWorker,
    lifecycle::{ClientId, ControlMessage},
    utils::response::ResponseBuilder,
};

#[async_trait]
trait Handler {
    async fn handle(
        &self,
        worker: &CacheWorker,
        session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> CacheResult<Response<Vec<u8>>>;
}

/// HTTP side of the control channel.
///
/// - `POST /control/messages`: deliver a message such as `{"type":"SKIP_WAITING"}`
/// - `GET /control/state`: lifecycle state, generations and stores
/// - `GET /control/ready`: 200 once a generation is active, 503 before
/// - `DELETE /control/registration`: stop intercepting
/// - `DELETE /control/clients/{id}`: close a client
pub struct ControlHttpApp {
    worker: Arc<CacheWorker>,
    router: Router<HashMap<Method, Box<dyn Handler + Send + Sync>>>,
}

impl ControlHttpApp {
    pub fn new(worker: Arc<CacheWorker>) -> CacheResult<Self> {
        let mut this = Self {
            worker,
            router: Router::new(),
        };

        this.route("/control/messages", Method::POST, Box::new(MessageHandler))?
            .route("/control/state", Method::GET, Box::new(StateHandler))?
            .route("/control/ready", Method::GET, Box::new(ReadyHandler))?
            .route(
                "/control/registration",
                Method::DELETE,
                Box::new(UnregisterHandler),
            )?
            .route(
                "/control/clients/{id}",
                Method::DELETE,
                Box::new(CloseClientHandler),
            )?;

        Ok(this)
    }

    fn route(
        &mut self,
        path: &str,
        method: Method,
        handler: Box<dyn Handler + Send + Sync>,
    ) -> CacheResult<&mut Self> {
        match self.router.at_mut(path) {
            Ok(routes) => {
                routes.value.insert(method, handler);
            }
            Err(_) => {
                let mut handlers = HashMap::new();
                handlers.insert(method, handler);
                self.router.insert(path, handlers).map_err(|e| {
                    CacheError::Configuration(format!("invalid control route {path}: {e}"))
                })?;
            }
        }
        Ok(self)
    }

    pub fn control_http_service(
        cfg: &Control,
        worker: Arc<CacheWorker>,
    ) -> CacheResult<Service<Self>> {
        let app = Self::new(worker)?;
        let mut service = Service::new("Control HTTP".to_string(), app);
        service.add_tcp(&cfg.address.to_string());
        Ok(service)
    }
}

#[async_trait]
impl ServeHttp for ControlHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        let (path, method) = {
            let req_header = http_session.req_header();
            (req_header.uri.path().to_string(), req_header.method.clone())
        };

        match self.router.at(&path) {
            Ok(Match { value, params }) => match value.get(&method) {
                Some(handler) => {
                    let params: BTreeMap<String, String> = params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    match handler.handle(&self.worker, http_session, params).await {
                        Ok(resp) => resp,
                        Err(e) => error_response(&e),
                    }
                }
                None => ResponseBuilder::error_http(StatusCode::METHOD_NOT_ALLOWED, ""),
            },
            Err(_) => ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

fn error_response(e: &CacheError) -> Response<Vec<u8>> {
    let status = match e {
        CacheError::InvalidTransition(_) => StatusCode::CONFLICT,
        CacheError::InstallFailure(_) | CacheError::Network(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    log::warn!("Control request failed: {e}");
    ResponseBuilder::error_http(status, &e.to_string())
}

#[derive(Serialize)]
struct MessageResponse {
    message: ControlMessage,
}

struct MessageHandler;

#[async_trait]
impl Handler for MessageHandler {
    async fn handle(
        &self,
        worker: &CacheWorker,
        http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> CacheResult<Response<Vec<u8>>> {
        let body = read_request_body(http_session).await?;
        let message = worker.post_message(&body).await?;
        Ok(ResponseBuilder::json(
            StatusCode::ACCEPTED,
            &MessageResponse { message },
        ))
    }
}

struct StateHandler;

#[async_trait]
impl Handler for StateHandler {
    async fn handle(
        &self,
        worker: &CacheWorker,
        _http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> CacheResult<Response<Vec<u8>>> {
        let state = worker.state().await?;
        Ok(ResponseBuilder::json(StatusCode::OK, &state))
    }
}

#[derive(Serialize)]
struct ReadyResponse<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

struct ReadyHandler;

#[async_trait]
impl Handler for ReadyHandler {
    async fn handle(
        &self,
        worker: &CacheWorker,
        _http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> CacheResult<Response<Vec<u8>>> {
        Ok(match worker.active_generation() {
            Some(generation) => ResponseBuilder::json(
                StatusCode::OK,
                &ReadyResponse {
                    status: "ok",
                    version: Some(generation.version().to_string()),
                },
            ),
            None => ResponseBuilder::json(
                StatusCode::SERVICE_UNAVAILABLE,
                &ReadyResponse {
                    status: "no active generation",
                    version: None,
                },
            ),
        })
    }
}

struct UnregisterHandler;

#[async_trait]
impl Handler for UnregisterHandler {
    async fn handle(
        &self,
        worker: &CacheWorker,
        _http_session: &mut ServerSession,
        _params: BTreeMap<String, String>,
    ) -> CacheResult<Response<Vec<u8>>> {
        if worker.unregister().await {
            Ok(ResponseBuilder::no_content())
        } else {
            Ok(ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Not Registered"))
        }
    }
}

struct CloseClientHandler;

#[async_trait]
impl Handler for CloseClientHandler {
    async fn handle(
        &self,
        worker: &CacheWorker,
        _http_session: &mut ServerSession,
        params: BTreeMap<String, String>,
    ) -> CacheResult<Response<Vec<u8>>> {
        let id = params
            .get("id")
            .ok_or_else(|| CacheError::Internal("missing client id".to_string()))?;
        if worker.close_client(&ClientId::new(id.as_str())) {
            // A generation waiting on this client may go ahead now.
            if let Err(e) = worker.activate_if_ready().await {
                log::warn!("Waiting generation could not activate: {e}");
            }
            Ok(ResponseBuilder::no_content())
        } else {
            Ok(ResponseBuilder::error_http(StatusCode::NOT_FOUND, "Unknown Client"))
        }
    }
}

async fn read_request_body(http_session: &mut ServerSession) -> CacheResult<Vec<u8>> {
    let mut body_data = Vec::new();
    while let Some(bytes) = http_session.read_request_body().await? {
        body_data.extend_from_slice(&bytes);
    }
    Ok(body_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::CacheStoreManager, config, network::mock::MockFetcher};

    fn app() -> ControlHttpApp {
        let worker = CacheWorker::new(
            CacheStoreManager::in_memory(),
            Arc::new(MockFetcher::new()),
            &config::Cache::default(),
        )
        .unwrap();
        ControlHttpApp::new(Arc::new(worker)).unwrap()
    }

    #[test]
    fn test_control_routes() {
        let app = app();
        let messages = app.router.at("/control/messages").unwrap();
        assert!(messages.value.contains_key(&Method::POST));
        assert!(!messages.value.contains_key(&Method::GET));

        let client = app.router.at("/control/clients/tab-1").unwrap();
        assert_eq!(client.params.get("id"), Some("tab-1"));

        assert!(app.router.at("/control/unknown").is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        let conflict = error_response(&CacheError::InvalidTransition("waiting".into()));
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let failed = error_response(&CacheError::InstallFailure("/index.html".into()));
        assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);

        let storage = error_response(&CacheError::Storage("disk full".into()));
        assert_eq!(storage.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
