//! HTTP control surface.
//!
//! Lets an operator manage the simulated instances,
//! tune the global error rate and latency offset,
//! and scrape the recorded metrics:
//!
//! | method     | path                    | effect                          |
//! |------------|-------------------------|---------------------------------|
//! | `GET`      | `/metrics`              | prometheus text exposition      |
//! | `GET`      | `/instances`            | all instances as JSON           |
//! | `GET`      | `/instance/{name}`      | a single instance as JSON       |
//! | `POST`     | `/instance/{name}`      | add an instance                 |
//! | `PUT`      | `/instance/{name}`      | replace an instance             |
//! | `DELETE`   | `/instance/{name}`      | delete an instance              |
//! | `GET`      | `/error_rate`           | current global error percentage |
//! | `PUT/POST` | `/error_rate/{n}`       | set global error percentage     |
//! | `GET`      | `/latency_offset`       | current global latency offset   |
//! | `PUT/POST` | `/latency_offset/{n}`   | set global latency offset       |
//!
//! Changes only affect ticks that start after the request was handled.

use std::{convert::Infallible, fmt, sync::Arc};

use rama::{
    Service,
    error::BoxError,
    http::{
        HeaderValue, Method, Request, Response, StatusCode,
        body::util::BodyExt as _,
        header::CONTENT_TYPE,
        service::web::response::{IntoResponse, Json},
    },
    telemetry::tracing,
};
use serde_json::json;

use crate::{
    instance::{InstanceSpec, RegistryError},
    metrics::{MetricsSink, PrometheusExporter, prometheus},
    simulation::SimulationState,
};

#[derive(Debug, Clone)]
pub struct ControlService {
    state: SimulationState,
    exporter: PrometheusExporter,
}

impl ControlService {
    pub fn try_new(state: SimulationState, sink: Arc<MetricsSink>) -> Result<Self, BoxError> {
        let exporter = PrometheusExporter::try_new(sink)?;
        Ok(Self { state, exporter })
    }

    async fn handle(&self, req: Request) -> Result<Response, ControlError> {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();

        match Route::parse(&path) {
            Route::Index => {
                only(&method, &[Method::GET])?;
                Ok(concat!(
                    "metricsim: synthetic latency and error-rate metrics\n",
                    "see /metrics for the recorded observations\n",
                )
                .into_response())
            }
            Route::Ping => {
                only(&method, &[Method::GET])?;
                Ok("pong".into_response())
            }
            Route::Metrics => {
                only(&method, &[Method::GET])?;
                self.metrics_response()
            }
            Route::Instances => {
                only(&method, &[Method::GET])?;
                let snapshot = self.state.registry().snapshot();
                Ok(Json(snapshot.as_map().clone()).into_response())
            }
            Route::Instance(name) => {
                if name.is_empty() {
                    return Err(ControlError::MissingName);
                }
                self.handle_instance(method, name, req).await
            }
            Route::ErrorRate(value) => {
                let error_pct = match value {
                    None => {
                        only(&method, &[Method::GET])?;
                        self.state.tunables().error_pct
                    }
                    Some(raw) => {
                        only(&method, &[Method::PUT, Method::POST])?;
                        let error_pct = parse_number("error rate", raw)?;
                        self.state.set_error_pct(error_pct);
                        error_pct
                    }
                };
                Ok(Json(json!({ "error_pct": error_pct })).into_response())
            }
            Route::LatencyOffset(value) => {
                let latency_offset_ms = match value {
                    None => {
                        only(&method, &[Method::GET])?;
                        self.state.tunables().latency_offset_ms
                    }
                    Some(raw) => {
                        only(&method, &[Method::PUT, Method::POST])?;
                        let latency_offset_ms = parse_number("latency offset", raw)?;
                        self.state.set_latency_offset_ms(latency_offset_ms);
                        latency_offset_ms
                    }
                };
                Ok(Json(json!({ "latency_offset_ms": latency_offset_ms })).into_response())
            }
            Route::Unknown => Err(ControlError::UnknownRoute(path.clone())),
        }
    }

    async fn handle_instance(
        &self,
        method: Method,
        name: &str,
        req: Request,
    ) -> Result<Response, ControlError> {
        let registry = self.state.registry();
        match method {
            Method::GET => match registry.get(name) {
                Some(instance) => Ok(Json(instance).into_response()),
                None => Err(RegistryError::NotFound(name.to_owned()).into()),
            },
            Method::POST => {
                let instance = read_instance_spec(req)
                    .await?
                    .into_instance(self.state.defaults());
                registry.add(name, instance)?;
                Ok((StatusCode::CREATED, Json(instance)).into_response())
            }
            Method::PUT => {
                let instance = read_instance_spec(req)
                    .await?
                    .into_instance(self.state.defaults());
                registry.replace(name, instance)?;
                Ok(Json(instance).into_response())
            }
            Method::DELETE => {
                registry.remove(name)?;
                Ok(StatusCode::NO_CONTENT.into_response())
            }
            _ => Err(ControlError::MethodNotAllowed(method)),
        }
    }

    fn metrics_response(&self) -> Result<Response, ControlError> {
        let body = self.exporter.encode().map_err(ControlError::Export)?;
        let mut resp = body.into_response();
        resp.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static(prometheus::CONTENT_TYPE),
        );
        Ok(resp)
    }
}

impl Service<Request> for ControlService {
    type Output = Response;
    type Error = Infallible;

    async fn serve(&self, req: Request) -> Result<Self::Output, Self::Error> {
        Ok(match self.handle(req).await {
            Ok(resp) => resp,
            Err(err) => {
                tracing::debug!("reject control request: {err}");
                err.into_response()
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    Index,
    Ping,
    Metrics,
    Instances,
    Instance(&'a str),
    ErrorRate(Option<&'a str>),
    LatencyOffset(Option<&'a str>),
    Unknown,
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Self {
        match path {
            "" | "/" => return Route::Index,
            "/ping" => return Route::Ping,
            "/metrics" => return Route::Metrics,
            "/instances" => return Route::Instances,
            "/error_rate" => return Route::ErrorRate(None),
            "/latency_offset" => return Route::LatencyOffset(None),
            _ => (),
        }

        if let Some(name) = path.strip_prefix("/instance/") {
            Route::Instance(name)
        } else if let Some(value) = path.strip_prefix("/error_rate/") {
            Route::ErrorRate(Some(value))
        } else if let Some(value) = path.strip_prefix("/latency_offset/") {
            Route::LatencyOffset(Some(value))
        } else {
            Route::Unknown
        }
    }
}

fn only(method: &Method, allowed: &[Method]) -> Result<(), ControlError> {
    if allowed.contains(method) {
        Ok(())
    } else {
        Err(ControlError::MethodNotAllowed(method.clone()))
    }
}

fn parse_number(what: &'static str, raw: &str) -> Result<i64, ControlError> {
    raw.trim()
        .parse()
        .map_err(|err| ControlError::MalformedInput(format!("invalid {what} '{raw}': {err}")))
}

async fn read_instance_spec(req: Request) -> Result<InstanceSpec, ControlError> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|err| ControlError::MalformedInput(format!("read request body: {err}")))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|err| ControlError::MalformedInput(format!("malformed instance: {err}")))
}

/// Reasons a control request is rejected.
///
/// None of these affect the simulation itself.
#[derive(Debug)]
pub enum ControlError {
    Registry(RegistryError),
    MissingName,
    MalformedInput(String),
    MethodNotAllowed(Method),
    UnknownRoute(String),
    Export(BoxError),
}

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::Registry(RegistryError::AlreadyExists(_)) => StatusCode::CONFLICT,
            ControlError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ControlError::MissingName | ControlError::MalformedInput(_) => {
                StatusCode::BAD_REQUEST
            }
            ControlError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ControlError::UnknownRoute(_) => StatusCode::NOT_FOUND,
            ControlError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

impl From<RegistryError> for ControlError {
    fn from(err: RegistryError) -> Self {
        ControlError::Registry(err)
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Registry(err) => err.fmt(f),
            ControlError::MissingName => write!(f, "missing instance name"),
            ControlError::MalformedInput(reason) => f.write_str(reason),
            ControlError::MethodNotAllowed(method) => write!(f, "method {method} not allowed"),
            ControlError::UnknownRoute(path) => write!(f, "no route for '{path}'"),
            ControlError::Export(err) => write!(f, "export metrics: {err}"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Registry(err) => Some(err),
            ControlError::Export(err) => Some(&**err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests;
