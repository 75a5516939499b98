//! Datascope Server and CLI
//!
//! Binary entry point for serving the permission layer and for previewing
//! rewrites and audits against a rule file.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use datascope::DataScope;
use datascope_common::config::{DataScopeConfig, LoggingConfig};
use datascope_common::RoleType;
use datascope_rls::{context, BoundStatement, FileRuleSource, RequestContext, RuleSource};

#[derive(Parser, Debug)]
#[command(name = "datascope")]
#[command(about = "Row-level data permission layer", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "datascope.toml", env = "DATASCOPE_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    /// Rule file; overrides `rules.path` from the config
    #[arg(short, long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Validate and list the rule file
    Rules,
    /// Print the statement as it would run for the given identity
    Rewrite {
        #[command(flatten)]
        identity: Identity,
        /// Run the write path instead of the read path
        #[arg(long)]
        write: bool,
        /// Operation id, checked against the bypass list
        #[arg(long, default_value = "")]
        operation: String,
        sql: String,
    },
    /// Print the ownership audit record for a write statement
    Audit {
        #[command(flatten)]
        identity: Identity,
        sql: String,
    },
}

#[derive(Args, Debug)]
struct Identity {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    role: RoleType,
    #[arg(long)]
    student_id: Option<i64>,
    #[arg(long)]
    teacher_id: Option<i64>,
    /// Set the request-level bypass flag
    #[arg(long)]
    ignore_permission_filter: bool,
}

impl Identity {
    fn context(&self) -> RequestContext {
        let mut ctx = RequestContext::new(self.user_id, self.role);
        if let Some(student_id) = self.student_id {
            ctx = ctx.with_student_id(student_id);
        }
        if let Some(teacher_id) = self.teacher_id {
            ctx = ctx.with_teacher_id(teacher_id);
        }
        if self.ignore_permission_filter {
            ctx = ctx.ignoring_permission_filter();
        }
        ctx
    }
}

fn init_logging(logging: &LoggingConfig, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if logging.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        DataScopeConfig::load(&cli.config)?
    } else {
        DataScopeConfig::default()
    };
    if let Some(rules) = &cli.rules {
        config.rules.path = Some(rules.clone());
    }

    init_logging(&config.logging, cli.log_level.as_deref());

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Rules => list_rules(config).await,
        Command::Rewrite {
            identity,
            write,
            operation,
            sql,
        } => {
            let scope = DataScope::new(config);
            scope.start().await;

            let statement = BoundStatement::new(operation, sql);
            let out = context::scope(Some(identity.context()), async move {
                if write {
                    scope.before_write(statement)
                } else {
                    scope.before_read(statement)
                }
            })
            .await;

            println!("{}", out.sql);
            Ok(())
        }
        Command::Audit { identity, sql } => {
            let scope = DataScope::new(config);
            scope.start().await;

            match scope.auditor().audit(&sql, Some(&identity.context())) {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("not audited"),
            }
            Ok(())
        }
    }
}

async fn serve(config: DataScopeConfig) -> anyhow::Result<()> {
    info!("Datascope v{}", env!("CARGO_PKG_VERSION"));

    let scope = Arc::new(DataScope::new(config));
    scope.start().await;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    tokio::select! {
        result = scope.clone().run() => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        () = shutdown => {
            scope.shutdown().await?;
        }
    }

    Ok(())
}

async fn list_rules(config: DataScopeConfig) -> anyhow::Result<()> {
    let Some(path) = config.rules.path.clone() else {
        anyhow::bail!("no rule file given; pass --rules or set rules.path");
    };

    let rules = FileRuleSource::new(&path).load_enabled().await?;
    let scope = DataScope::new(config);
    let active = scope.registry().load(&rules);

    for rule in scope.registry().all_rules() {
        println!(
            "{:<8} {:<28} {} {:?} {}{}",
            rule.role.as_str(),
            rule.table,
            rule.filter_field,
            rule.filter_operator,
            rule.context_field,
            rule.subquery_template
                .as_deref()
                .map(|t| format!("  [{t}]"))
                .unwrap_or_default(),
        );
    }
    println!("{active} active of {} enabled in {}", rules.len(), path.display());
    Ok(())
}
