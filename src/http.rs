//! HTTP surface: rewrite preview and rule administration

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use datascope_common::error::{Error, Result};
use datascope_common::RoleType;
use datascope_identity::{HttpError, RequestScope};
use datascope_rls::{context, BoundStatement};

use crate::DataScope;

/// Statement submitted for rewriting under the caller's identity
#[derive(Debug, Serialize, Deserialize)]
pub struct RewriteRequest {
    #[serde(default)]
    pub operation: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    /// Run the pre-write hooks instead of the pre-read hooks
    #[serde(default)]
    pub write: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RewriteResponse {
    pub sql: String,
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub active: usize,
    pub generation: u64,
}

/// Register the routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check)).service(
        web::scope("/v1")
            .route("/rewrite", web::post().to(rewrite))
            .route("/rules", web::get().to(list_rules))
            .route("/rules/reload", web::post().to(reload_rules)),
    );
}

pub(crate) async fn serve(state: Arc<DataScope>) -> Result<()> {
    let host = state.config().server.host.clone();
    let port = state.config().server.port;

    info!("Starting data permission service on {}:{}", host, port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(RequestScope)
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    Ok(())
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "datascope",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn rewrite(state: web::Data<Arc<DataScope>>, body: web::Json<RewriteRequest>) -> HttpResponse {
    let request = body.into_inner();
    let statement = BoundStatement::new(request.operation, request.sql.clone()).with_params(request.params);

    let statement = if request.write {
        state.before_write(statement)
    } else {
        state.before_read(statement)
    };

    HttpResponse::Ok().json(RewriteResponse {
        changed: statement.sql != request.sql,
        sql: statement.sql,
    })
}

fn require_admin() -> std::result::Result<(), HttpError> {
    let ctx = context::current().ok_or(Error::Forbidden)?;
    ctx.require_role(&[RoleType::Admin])?;
    Ok(())
}

async fn list_rules(state: web::Data<Arc<DataScope>>) -> std::result::Result<HttpResponse, HttpError> {
    require_admin()?;
    Ok(HttpResponse::Ok().json(state.registry().all_rules()))
}

async fn reload_rules(state: web::Data<Arc<DataScope>>) -> std::result::Result<HttpResponse, HttpError> {
    require_admin()?;
    let active = state.reload_rules().await?;

    Ok(HttpResponse::Ok().json(ReloadResponse {
        active,
        generation: state.registry().snapshot().generation(),
    }))
}
