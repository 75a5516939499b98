//! Request-scoped identity middleware

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderMap;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::fmt;
use std::rc::Rc;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use datascope_common::{ApiError, Error, RoleType};
use datascope_rls::context::{self, RequestContext};

pub const USER_ID_HEADER: &str = "userid";
pub const USER_TYPE_HEADER: &str = "usertype";
pub const STUDENT_ID_HEADER: &str = "studentid";
pub const TEACHER_ID_HEADER: &str = "teacherid";

/// Build the request context from trusted identity headers.
///
/// A request without a `userType` header, or with an empty one, is
/// anonymous and yields `None`.
///
/// # Errors
/// Returns `InvalidIdentity` when `userType` names an unknown role, when
/// `userId` is missing, or when any id header is not an integer.
pub fn identity_from_headers(headers: &HeaderMap) -> datascope_common::Result<Option<RequestContext>> {
    let Some(user_type) = header_str(headers, USER_TYPE_HEADER)?.filter(|value| !value.is_empty()) else {
        return Ok(None);
    };

    let role: RoleType = user_type
        .parse()
        .map_err(|_| Error::InvalidIdentity(format!("unknown userType '{user_type}'")))?;

    let user_id = id_header(headers, USER_ID_HEADER)?
        .ok_or_else(|| Error::InvalidIdentity("userId header is required".to_string()))?;

    let mut ctx = RequestContext::new(user_id, role);
    if let Some(student_id) = id_header(headers, STUDENT_ID_HEADER)? {
        ctx = ctx.with_student_id(student_id);
    }
    if let Some(teacher_id) = id_header(headers, TEACHER_ID_HEADER)? {
        ctx = ctx.with_teacher_id(teacher_id);
    }

    Ok(Some(ctx))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> datascope_common::Result<Option<&'a str>> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| Error::InvalidIdentity(format!("{name} is not valid text")))
        })
        .transpose()
}

fn id_header(headers: &HeaderMap, name: &str) -> datascope_common::Result<Option<i64>> {
    header_str(headers, name)?
        .filter(|value| !value.is_empty())
        .map(|value| {
            value
                .parse::<i64>()
                .map_err(|_| Error::InvalidIdentity(format!("{name} '{value}' is not an integer")))
        })
        .transpose()
}

/// Error rendered as a JSON [`ApiError`] body
#[derive(Debug)]
pub struct HttpError(pub Error);

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ResponseError for HttpError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ApiError::from(&self.0))
    }
}

/// Binds the caller's [`RequestContext`] for exactly the lifetime of each
/// request future; it is gone once the response is produced, the handler
/// fails, or the future is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestScope;

impl<S, B> Transform<S, ServiceRequest> for RequestScope
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Transform = RequestScopeMiddleware<S>;
    type InitError = ();
    type Future = Ready<std::result::Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestScopeMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct RequestScopeMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for RequestScopeMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let span = info_span!(
            "request",
            request_id = %Uuid::new_v4(),
            method = %req.method(),
            path = %req.path(),
        );
        let service = Rc::clone(&self.service);

        Box::pin(
            async move {
                let identity = match identity_from_headers(req.headers()) {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!(error = %e, "Rejected request identity");
                        return Err(actix_web::Error::from(HttpError(e)));
                    }
                };

                context::scope(identity, async move { service.call(req).await }).await
            }
            .instrument(span),
        )
    }
}
