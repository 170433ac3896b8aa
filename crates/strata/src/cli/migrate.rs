use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use console::style;
use tracing::debug;

use strata_core::config::{AppliedStoreKind, LockKind, StrataConfig};
use strata_core::migration::{load_records_from_dir, MigrationGraph, MigrationId};
use strata_runtime::backend::render_script;
use strata_runtime::{
    collect_sql, load_models_file, AppliedSet, Database, ExecutorOptions, FileLock, JsonAppliedSet,
    LocalLock, MemoryAppliedSet, MemoryDatabase, MigrationExecutor, MigrationGenerator,
    MigrationLock, MigrationPlan, MigrationRunResult, MigrationTarget, PgAdvisoryLock, PgAppliedSet,
    PgSchemaEditor,
};

use super::init_tracing;

/// Manage database migrations.
#[derive(Parser)]
pub struct MigrateCommand {
    #[command(subcommand)]
    pub action: MigrateAction,

    /// Configuration file path.
    #[arg(short, long, default_value = "strata.toml", global = true)]
    pub config: String,

    /// Migrations directory path (overrides `migrations.dir`).
    #[arg(short, long, global = true)]
    pub migrations_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Apply every pending migration.
    Up {
        /// Mark migrations as applied without running them.
        #[arg(long)]
        fake: bool,

        /// Print the plan and its SQL instead of running it.
        #[arg(long)]
        plan: bool,
    },

    /// Migrate one app forwards or backwards to a named migration.
    To {
        app: String,

        /// Migration name, or `zero` to unapply the whole app.
        name: String,

        #[arg(long)]
        fake: bool,

        #[arg(long)]
        plan: bool,
    },

    /// Rollback the last N migrations.
    Down {
        /// Number of migrations to rollback.
        #[arg(default_value = "1")]
        count: usize,
    },

    /// Show migration status.
    Status,

    /// Print the SQL of one migration.
    Sql {
        app: String,
        name: String,

        /// Print the SQL that unapplies it.
        #[arg(long)]
        backwards: bool,
    },

    /// Replay every migration forwards and back against an in-memory store.
    Check,

    /// Generate a migration from a models file.
    Make {
        app: String,

        /// TOML file listing the desired models of the app.
        #[arg(long)]
        models: PathBuf,

        /// Name fragment (defaults to one derived from the changes).
        #[arg(long)]
        name: Option<String>,

        /// Print the record instead of writing it.
        #[arg(long)]
        dry_run: bool,
    },
}

impl MigrateAction {
    fn needs_database(&self) -> bool {
        matches!(
            self,
            MigrateAction::Up { .. }
                | MigrateAction::To { .. }
                | MigrateAction::Down { .. }
                | MigrateAction::Status
        )
    }
}

impl MigrateCommand {
    pub async fn execute(self) -> Result<()> {
        // Load .env if present
        dotenvy::dotenv().ok();

        let config_path = Path::new(&self.config);
        let config = if config_path.exists() {
            StrataConfig::from_file(config_path)?
        } else if self.action.needs_database() {
            anyhow::bail!("Configuration file not found: {}", self.config);
        } else {
            StrataConfig::default()
        };
        init_tracing(&config.logging);

        let migrations_dir = self
            .migrations_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| config.migrations.dir.clone());
        let records = load_records_from_dir(&migrations_dir)
            .with_context(|| format!("Failed to load migrations from {}", migrations_dir.display()))?;
        let graph = MigrationGraph::new(records)?;
        debug!(records = graph.len(), "Loaded migration graph");

        // `sql` output is meant to be piped.
        if !matches!(self.action, MigrateAction::Sql { .. }) {
            header("Migrations");
        }

        match self.action {
            MigrateAction::Up { fake, plan } => {
                migrate_to(&config, &graph, MigrationTarget::Latest, fake, plan).await?;
            }

            MigrateAction::To {
                app,
                name,
                fake,
                plan,
            } => {
                let target = if name == "zero" {
                    MigrationTarget::Zero(app)
                } else {
                    MigrationTarget::To(MigrationId::new(app, name))
                };
                migrate_to(&config, &graph, target, fake, plan).await?;
            }

            MigrateAction::Down { count } => {
                if count == 0 {
                    println!("  {} Nothing to rollback (count=0)", style("ℹ").blue());
                    return Ok(());
                }
                println!(
                    "  {} Rolling back {} migration(s)...",
                    style("→").dim(),
                    count
                );
                let (mut executor, db) = connect(&config).await?;
                let result = executor.rollback_last(&graph, count).await;
                db.close().await;
                print_run(&result?);
            }

            MigrateAction::Status => {
                let (mut executor, db) = connect(&config).await?;
                let status = executor.status(&graph).await;
                db.close().await;
                let status = status?;

                if status.applied.is_empty() && status.pending.is_empty() && status.unknown.is_empty() {
                    println!("  {} No migrations found", style("ℹ").blue());
                    return Ok(());
                }

                if !status.applied.is_empty() {
                    println!("  {} Applied:", style("✓").green());
                    for m in &status.applied {
                        println!(
                            "    {} {} ({})",
                            style(&m.id).cyan(),
                            style("at").dim(),
                            m.applied_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }

                if !status.pending.is_empty() {
                    println!("  {} Pending:", style("○").yellow());
                    for id in &status.pending {
                        println!("    {} {}", style("→").dim(), style(id).yellow());
                    }
                }

                if !status.unknown.is_empty() {
                    println!("  {} Applied but not on disk:", style("!").red());
                    for m in &status.unknown {
                        println!("    {} {}", style("?").red(), m.id);
                    }
                }

                println!();
                println!(
                    "  {} {} applied, {} pending",
                    style("ℹ").blue(),
                    status.applied.len(),
                    status.pending.len()
                );
            }

            MigrateAction::Sql {
                app,
                name,
                backwards,
            } => {
                let statements = collect_sql(&graph, &MigrationId::new(app, name), backwards).await?;
                println!("{}", render_script(&statements));
            }

            MigrateAction::Check => {
                let report = check_graph(&graph).await?;
                println!(
                    "  {} {} migration(s) applied in memory",
                    style("✓").green(),
                    report.applied
                );
                if report.irreversible.is_empty() {
                    println!(
                        "  {} Rolled back to an empty schema",
                        style("✓").green()
                    );
                } else {
                    println!(
                        "  {} Skipped rollback check, irreversible migrations:",
                        style("ℹ").blue()
                    );
                    for id in &report.irreversible {
                        println!("    {} {}", style("→").dim(), id);
                    }
                }
            }

            MigrateAction::Make {
                app,
                models,
                name,
                dry_run,
            } => {
                let desired = load_models_file(&app, &models)?;
                let generator = MigrationGenerator::new(&migrations_dir);
                let Some(migration) =
                    generator.generate(&app, &graph, &desired, name.as_deref(), Utc::now())?
                else {
                    println!("  {} No changes detected", style("ℹ").blue());
                    return Ok(());
                };

                for entry in &migration.diff.entries {
                    println!("  {} {}", style("+").green(), entry.details);
                }
                if dry_run {
                    println!();
                    println!("{}", generator.render(&migration)?);
                } else {
                    generator.write_migration(&migration)?;
                    println!(
                        "  {} Created {}",
                        style("✓").green(),
                        style(migration.path.display()).cyan()
                    );
                }
            }
        }

        println!();
        Ok(())
    }
}

fn header(title: &str) {
    println!();
    println!(
        "  {} {}",
        style("strata").bold().cyan(),
        style(title).bold()
    );
    println!();
}

async fn connect(config: &StrataConfig) -> Result<(MigrationExecutor, Database)> {
    let db = Database::from_config(&config.database).await?;
    let pool = db.pool().clone();
    let migrations = &config.migrations;

    let editor = PgSchemaEditor::new(pool.clone())
        .with_statement_timeout(db.statement_timeout())
        .with_ledger(migrations.applied_store == AppliedStoreKind::Database);
    let applied: Box<dyn AppliedSet> = match migrations.applied_store {
        AppliedStoreKind::Database => Box::new(PgAppliedSet::new(pool.clone())),
        AppliedStoreKind::File => Box::new(JsonAppliedSet::new(&migrations.applied_file)),
    };
    let lock: Box<dyn MigrationLock> = match migrations.lock {
        LockKind::Advisory => Box::new(PgAdvisoryLock::new(pool, migrations.lock_id)),
        LockKind::File => Box::new(FileLock::new(&migrations.lock_file)),
    };

    let executor = MigrationExecutor::from_boxed(Box::new(editor), applied, lock)
        .with_options(ExecutorOptions::from_config(migrations));
    Ok((executor, db))
}

async fn migrate_to(
    config: &StrataConfig,
    graph: &MigrationGraph,
    target: MigrationTarget,
    fake: bool,
    plan_only: bool,
) -> Result<()> {
    if graph.is_empty() {
        println!("  {} No migrations found", style("ℹ").blue());
        return Ok(());
    }

    let (mut executor, db) = connect(config).await?;
    executor.set_fake(fake);

    let outcome = if plan_only {
        match executor.plan(graph, &target).await {
            Ok(plan) => print_plan(graph, &plan).await,
            Err(e) => Err(e.into()),
        }
    } else {
        println!("  {} Migrating to {}...", style("→").dim(), target);
        executor
            .migrate(graph, &target)
            .await
            .map(|result| print_run(&result))
            .map_err(Into::into)
    };
    db.close().await;
    outcome
}

async fn print_plan(graph: &MigrationGraph, plan: &MigrationPlan) -> Result<()> {
    if plan.is_empty() {
        println!("  {} No planned migration operations", style("ℹ").blue());
        return Ok(());
    }
    for step in &plan.steps {
        println!("  {} {}", style("→").dim(), style(step).cyan());
        let statements = collect_sql(graph, &step.id, step.is_backwards()).await?;
        for line in render_script(&statements).lines() {
            println!("      {}", style(line).dim());
        }
    }
    Ok(())
}

fn print_run(result: &MigrationRunResult) {
    if result.is_noop() {
        println!("  {} No migrations to apply", style("ℹ").blue());
        return;
    }
    let marker = if result.fake { " (fake)" } else { "" };
    for id in &result.applied {
        println!("  {} Applied: {}{}", style("✓").green(), id, marker);
    }
    for id in &result.unapplied {
        println!("  {} Unapplied: {}{}", style("✓").green(), id, marker);
    }
    println!();
    println!(
        "  {} {} applied, {} unapplied, {} already applied in {:.2?}",
        style("ℹ").blue(),
        result.applied.len(),
        result.unapplied.len(),
        result.skipped,
        result.elapsed
    );
}

/// Outcome of replaying the graph in memory.
#[derive(Debug)]
pub struct CheckReport {
    pub applied: usize,
    /// Records that block the rollback half of the check.
    pub irreversible: Vec<MigrationId>,
}

/// Apply every record to an empty in-memory store, then, when every record
/// is reversible, roll everything back and expect an empty schema.
pub async fn check_graph(graph: &MigrationGraph) -> Result<CheckReport> {
    let db = MemoryDatabase::new();
    let mut executor = MigrationExecutor::new(db.clone(), MemoryAppliedSet::new(), LocalLock::new());

    let applied = executor.migrate(graph, &MigrationTarget::Latest).await?.applied.len();

    let irreversible: Vec<MigrationId> = graph
        .records()
        .filter(|r| !r.is_reversible())
        .map(|r| r.id.clone())
        .collect();
    if irreversible.is_empty() {
        executor.rollback_last(graph, graph.len()).await?;
        let leftover = db.table_names();
        if !leftover.is_empty() {
            anyhow::bail!(
                "Tables left after rolling back every migration: {}",
                leftover.join(", ")
            );
        }
    }

    Ok(CheckReport {
        applied,
        irreversible,
    })
}
