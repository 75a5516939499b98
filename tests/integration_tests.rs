//! Integration tests for the assembled permission layer

use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use std::io::Write;
use std::sync::Arc;

use datascope::http::{self, ReloadResponse, RewriteResponse};
use datascope::DataScope;
use datascope_common::config::{BypassEntry, DataScopeConfig};
use datascope_common::RoleType;
use datascope_identity::RequestScope;
use datascope_rls::{context, AccessRule, BoundStatement, RequestContext, StaticRuleSource};

fn rules() -> Vec<AccessRule> {
    vec![
        AccessRule::new(RoleType::Student, "course_enrollment", "student_id", "studentId"),
        AccessRule::new(RoleType::Teacher, "course_info", "teacher_id", "teacherId"),
        AccessRule::new(RoleType::Teacher, "course_enrollment", "course_id", "teacherId")
            .with_subquery("SELECT id FROM course_info WHERE teacher_id = ?"),
    ]
}

async fn started(config: DataScopeConfig) -> Arc<DataScope> {
    let scope = DataScope::with_source(config, Arc::new(StaticRuleSource::new(rules())));
    assert_eq!(scope.start().await, 3);
    Arc::new(scope)
}

// ===== Hook Pipeline Tests =====

mod pipeline {
    use super::*;

    #[tokio::test]
    async fn test_read_and_write_paths() {
        let scope = started(DataScopeConfig::default()).await;

        let (read, write) = context::scope(Some(RequestContext::teacher(3, 17)), async {
            let read = scope.before_read(BoundStatement::new(
                "EnrollmentMapper.selectList",
                "SELECT * FROM course_enrollment",
            ));
            let write = scope.before_write(BoundStatement::new(
                "CourseMapper.updateById",
                "UPDATE course_info SET name = 'Algebra' WHERE id = 5",
            ));
            (read, write)
        })
        .await;

        assert_eq!(
            read.sql,
            "SELECT * FROM course_enrollment WHERE course_id IN (SELECT id FROM course_info WHERE teacher_id = 17)"
        );
        assert_eq!(
            write.sql,
            "UPDATE course_info SET name = 'Algebra' WHERE id = 5 AND teacher_id = 17"
        );
    }

    #[tokio::test]
    async fn test_configured_bypass() {
        let mut config = DataScopeConfig::default();
        config.bypass.push(BypassEntry {
            operation: "EnrollmentMapper.selectOwn".to_string(),
            reason: "filters on student_id itself".to_string(),
        });
        let scope = started(config).await;

        let sql = "SELECT * FROM course_enrollment WHERE student_id = 42";
        let out = context::scope(Some(RequestContext::student(7, 42)), async {
            scope.before_read(BoundStatement::new("EnrollmentMapper.selectOwn", sql))
        })
        .await;
        assert_eq!(out.sql, sql);
    }

    #[tokio::test]
    async fn test_disabled_layer_is_identity() {
        let mut config = DataScopeConfig::default();
        config.rls.enabled = false;
        let scope = started(config).await;

        let sql = "SELECT * FROM course_enrollment";
        let out = context::scope(Some(RequestContext::student(7, 42)), async {
            scope.before_read(BoundStatement::new("EnrollmentMapper.selectList", sql))
        })
        .await;
        assert_eq!(out.sql, sql);
    }

    #[tokio::test]
    async fn test_file_backed_rules() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[[rules]]
role = "student"
table = "course_enrollment"
filter_field = "student_id"
context_field = "studentId"
"#
        )
        .unwrap();

        let mut config = DataScopeConfig::default();
        config.rules.path = Some(file.path().to_path_buf());
        let scope = DataScope::new(config);

        assert_eq!(scope.start().await, 1);
        assert_eq!(scope.reload_rules().await.unwrap(), 1);
    }
}

// ===== HTTP Tests =====

mod http_api {
    use super::*;

    #[actix_web::test]
    async fn test_rewrite_endpoint() {
        let scope = started(DataScopeConfig::default()).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(scope))
                .wrap(RequestScope)
                .configure(http::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/rewrite")
            .insert_header(("userId", "7"))
            .insert_header(("userType", "student"))
            .insert_header(("studentId", "42"))
            .set_json(serde_json::json!({ "sql": "SELECT id FROM course_enrollment WHERE status = 1" }))
            .to_request();
        let res: RewriteResponse = test::call_and_read_body_json(&app, req).await;

        assert!(res.changed);
        assert_eq!(
            res.sql,
            "SELECT id FROM course_enrollment WHERE status = 1 AND student_id = 42"
        );
    }

    #[actix_web::test]
    async fn test_reload_requires_admin() {
        let scope = started(DataScopeConfig::default()).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(scope))
                .wrap(RequestScope)
                .configure(http::configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/v1/rules/reload")
            .insert_header(("userId", "3"))
            .insert_header(("userType", "teacher"))
            .insert_header(("teacherId", "17"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::post().uri("/v1/rules/reload").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::post()
            .uri("/v1/rules/reload")
            .insert_header(("userId", "1"))
            .insert_header(("userType", "admin"))
            .to_request();
        let res: ReloadResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(res.active, 3);
        assert!(res.generation >= 2);
    }

    #[actix_web::test]
    async fn test_list_rules() {
        let scope = started(DataScopeConfig::default()).await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(scope))
                .wrap(RequestScope)
                .configure(http::configure),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/v1/rules")
            .insert_header(("userId", "1"))
            .insert_header(("userType", "admin"))
            .to_request();
        let rules: Vec<AccessRule> = test::call_and_read_body_json(&app, req).await;

        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].role, RoleType::Student);
    }
}
