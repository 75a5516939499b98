//! Rewriter integration tests

use std::sync::Arc;

use datascope_common::RoleType;
use datascope_rls::{context, AccessRule, FilterOperator, RequestContext, Rewriter, RuleRegistry};
use proptest::prelude::*;
use rstest::rstest;

fn rewriter() -> Rewriter {
    let registry = Arc::new(RuleRegistry::new());
    registry.load(&[
        AccessRule::new(RoleType::Student, "course_enrollment", "student_id", "studentId"),
        AccessRule::new(RoleType::Student, "homework_submission", "student_id", "studentId")
            .with_operator(FilterOperator::In),
        AccessRule::new(RoleType::Teacher, "course_info", "teacher_id", "teacherId"),
        AccessRule::new(RoleType::Teacher, "course_enrollment", "course_id", "teacherId")
            .with_subquery("SELECT id FROM course_info WHERE teacher_id = ?"),
    ]);
    Rewriter::new(registry)
}

fn student() -> RequestContext {
    RequestContext::student(7, 42)
}

fn teacher() -> RequestContext {
    RequestContext::teacher(3, 17)
}

// ===== Table-Driven Rewrites =====

mod table_driven {
    use super::*;

    #[rstest]
    #[case(
        "SELECT * FROM course_enrollment",
        "SELECT * FROM course_enrollment WHERE student_id = 42"
    )]
    #[case(
        "SELECT * FROM course_enrollment WHERE status = 1",
        "SELECT * FROM course_enrollment WHERE status = 1 AND student_id = 42"
    )]
    #[case(
        "SELECT * FROM course_enrollment AS e",
        "SELECT * FROM course_enrollment AS e WHERE e.student_id = 42"
    )]
    #[case(
        "SELECT id FROM homework_submission",
        "SELECT id FROM homework_submission WHERE student_id IN (42)"
    )]
    #[case(
        "SELECT * FROM course_info WHERE id = 5",
        "SELECT * FROM course_info WHERE id = 5"
    )]
    #[case(
        "SELECT id FROM course_enrollment UNION SELECT id FROM course_enrollment",
        "SELECT id FROM course_enrollment WHERE student_id = 42 UNION SELECT id FROM course_enrollment WHERE student_id = 42"
    )]
    #[case(
        "SELECT course_id FROM course_enrollment UNION SELECT course_id FROM homework_submission",
        "SELECT course_id FROM course_enrollment WHERE student_id = 42 UNION SELECT course_id FROM homework_submission WHERE student_id IN (42)"
    )]
    #[case(
        "WITH course_enrollment AS (SELECT 1 AS x) SELECT x FROM course_enrollment",
        "WITH course_enrollment AS (SELECT 1 AS x) SELECT x FROM course_enrollment"
    )]
    #[case(
        "SELECT * FROM course_enrollment LIMIT ?, ?",
        "SELECT * FROM course_enrollment WHERE student_id = 42 LIMIT ?, ?"
    )]
    #[case(
        "SELECT t.id FROM (SELECT id FROM course_enrollment) AS t",
        "SELECT t.id FROM (SELECT id FROM course_enrollment WHERE student_id = 42) AS t"
    )]
    fn test_student_rewrites(#[case] sql: &str, #[case] expected: &str) {
        assert_eq!(rewriter().rewrite(sql, Some(&student())), expected);
    }

    #[rstest]
    #[case(
        "SELECT name FROM course_info",
        "SELECT name FROM course_info WHERE teacher_id = 17"
    )]
    #[case(
        "SELECT * FROM course_enrollment WHERE status = 1",
        "SELECT * FROM course_enrollment WHERE status = 1 AND course_id IN (SELECT id FROM course_info WHERE teacher_id = 17)"
    )]
    fn test_teacher_rewrites(#[case] sql: &str, #[case] expected: &str) {
        assert_eq!(rewriter().rewrite(sql, Some(&teacher())), expected);
    }
}

// ===== Joins =====

mod joins {
    use super::*;

    #[test]
    fn test_join_qualifies_with_alias() {
        let sql = "SELECT e.id, c.name FROM course_enrollment e JOIN course_info c ON e.course_id = c.id WHERE e.status = 1";
        let out = rewriter().rewrite(sql, Some(&student()));

        assert!(out.ends_with("WHERE e.status = 1 AND e.student_id = 42"), "{out}");
    }

    #[test]
    fn test_join_filters_both_tables() {
        let registry = Arc::new(RuleRegistry::new());
        registry.load(&[
            AccessRule::new(RoleType::Student, "course_enrollment", "student_id", "studentId"),
            AccessRule::new(RoleType::Student, "course_info", "id", "studentId")
                .with_subquery("SELECT course_id FROM course_enrollment WHERE student_id = ?"),
        ]);
        let rewriter = Rewriter::new(registry);

        let sql = "SELECT * FROM course_info c JOIN course_enrollment e ON c.id = e.course_id WHERE c.status = 1";
        let out = rewriter.rewrite(sql, Some(&student()));

        assert!(
            out.ends_with(
                "WHERE c.status = 1 AND c.id IN (SELECT course_id FROM course_enrollment WHERE student_id = 42) AND e.student_id = 42"
            ),
            "{out}"
        );
    }

    #[test]
    fn test_join_without_alias_uses_table_name() {
        let sql = "SELECT * FROM course_enrollment JOIN course_info ON course_enrollment.course_id = course_info.id";
        let out = rewriter().rewrite(sql, Some(&teacher()));

        assert!(
            out.ends_with(
                "WHERE course_enrollment.course_id IN (SELECT id FROM course_info WHERE teacher_id = 17) AND course_info.teacher_id = 17"
            ),
            "{out}"
        );
    }
}

// ===== Passthrough =====

mod passthrough {
    use super::*;

    #[test]
    fn test_no_context() {
        let sql = "SELECT * FROM course_enrollment";
        assert_eq!(rewriter().rewrite(sql, None), sql);
    }

    #[test]
    fn test_admin() {
        let sql = "SELECT * FROM course_enrollment";
        assert_eq!(rewriter().rewrite(sql, Some(&RequestContext::admin(1))), sql);
    }

    #[test]
    fn test_formatting_preserved_when_unchanged() {
        let sql = "select *\n  from   course_info   where id=5";
        assert_eq!(rewriter().rewrite(sql, Some(&student())), sql);
    }

    #[test]
    fn test_multi_statement_batch() {
        let sql = "SELECT * FROM course_info; SELECT * FROM course_enrollment";
        assert_eq!(
            rewriter().rewrite(sql, Some(&student())),
            "SELECT * FROM course_info; SELECT * FROM course_enrollment WHERE student_id = 42"
        );
    }

    #[test]
    fn test_scoped_context() {
        let rewriter = rewriter();
        let out = context::sync_scope(Some(student()), || {
            rewriter.rewrite("SELECT * FROM course_enrollment", context::current().as_ref())
        });

        assert_eq!(out, "SELECT * FROM course_enrollment WHERE student_id = 42");
        assert!(context::current().is_none());
    }
}

// ===== Properties =====

mod properties {
    use super::*;

    proptest! {
        #[test]
        fn test_admin_is_identity(sql in ".*") {
            let out = rewriter().rewrite(&sql, Some(&RequestContext::admin(1)));
            prop_assert_eq!(out, sql);
        }

        #[test]
        fn test_bypass_is_identity(sql in ".*") {
            let ctx = student().ignoring_permission_filter();
            let out = rewriter().rewrite(&sql, Some(&ctx));
            prop_assert_eq!(out, sql);
        }

        #[test]
        fn test_unruled_table_is_identity(table in "[a-z]{3,12}", id in 0i64..10_000) {
            prop_assume!(table != "course_info");
            let sql = format!("SELECT  *  FROM {table} WHERE id = {id}");
            prop_assert_eq!(rewriter().rewrite(&sql, Some(&teacher())), sql);
        }

        #[test]
        fn test_arbitrary_input_never_panics(sql in "\\PC*") {
            let out = rewriter().rewrite(&sql, Some(&student()));
            if !sql.to_ascii_lowercase().contains("course_enrollment")
                && !sql.to_ascii_lowercase().contains("homework_submission")
            {
                prop_assert_eq!(out, sql);
            }
        }

        #[test]
        fn test_deep_nesting_never_panics(depth in 1usize..200) {
            let sql = format!(
                "SELECT * FROM course_enrollment WHERE id IN {}1{}",
                "(SELECT ".repeat(depth),
                ")".repeat(depth)
            );
            let _ = rewriter().rewrite(&sql, Some(&student()));
        }
    }
}
