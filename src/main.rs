use std::{path::PathBuf, sync::atomic::Ordering};

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use tracing_subscriber::EnvFilter;

mod app;
mod capabilities;
mod catalog;
mod categories;
mod cli;
mod config;
mod images;
mod pipeline;
mod scan;
mod search;
mod storage;
mod task_runner;
#[cfg(test)]
mod tests;
mod web;

use app::App;
use catalog::{ItemId, ProcessingState};
use cli::{CategoriesCommand, Command};
use config::Config;
use search::SearchRequest;

fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("PHOTOTAG_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("couldn't find home dir")?
        .context("couldn't find home dir")?;
    Ok(home.join(".local/share/phototag"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Queues `ids`, then waits for all of them. Ctrl+C leaves the ones that
/// have not started for the next run.
fn process(mut app: App, ids: Vec<ItemId>) -> anyhow::Result<()> {
    if ids.is_empty() {
        println!("nothing to process");
        return Ok(());
    }

    let stop = app.stop_handle();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        stop.store(true, Ordering::Relaxed);
    })
    .context("failed to set Ctrl+C handler")?;

    app.run_queue();
    for id in &ids {
        app.enqueue(*id)?;
    }
    log::info!("queued {} photos", ids.len());

    app.shutdown();
    app.wait_task_queue_finish();

    let mut summary = std::collections::BTreeMap::<ProcessingState, usize>::new();
    for id in &ids {
        if let Some(item) = app.catalog.item(*id)? {
            *summary.entry(item.state).or_default() += 1;
        }
    }
    for (state, count) in summary {
        println!("{state}: {count}");
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();

    let config = Config::load_with(base_path()?)?;
    let mut app = App::new(config)?;

    match args.command {
        Command::Scan { dir, no_process } => {
            let report = app.scan(dir.as_deref(), true)?;
            println!(
                "{} new, {} to retry, {} skipped, {} not images",
                report.created.len(),
                report.requeued.len(),
                report.skipped,
                report.rejected
            );

            if !no_process {
                process(app, report.to_process())?;
            }
        }

        Command::Process { ids, pending } => {
            let ids = if pending {
                app.catalog
                    .items()?
                    .into_iter()
                    .filter(|item| {
                        matches!(item.state, ProcessingState::Pending | ProcessingState::Failed)
                    })
                    .map(|item| item.id)
                    .collect()
            } else {
                ids
            };

            process(app, ids)?;
        }

        Command::Search(args) => {
            let request = SearchRequest {
                query: args.query,
                mode: args.mode,
                categories: args.categories,
                date_from: args.from,
                date_to: args.to,
                page: Some(args.page),
                page_size: args.page_size,
            };

            let response = app.search(&request);
            if let Some(error) = &response.error {
                bail!("search failed: {error}");
            }
            print_json(&response)?;
        }

        Command::Serve { addr } => {
            if let Some(addr) = addr {
                app.set_server_addr(addr);
            }

            // models are loaded before the runtime starts, the blocking
            // inference client can't be created inside it
            app.models
                .initialize()
                .context("failed to initialize models")?;

            app.run_queue();
            web::start_daemon(app)?;
        }

        Command::Stats {} => print_json(&app.stats()?)?,

        Command::Show { id } => print_json(&app.details(id)?)?,

        Command::Categories { command } => match command {
            CategoriesCommand::Sync {} => {
                let report = app.sync_categories()?;
                println!(
                    "{} created, {} already present",
                    report.created, report.unchanged
                );

                if !report.conflicts.is_empty() {
                    println!("\nThe following labels already map to a different category:");
                    for conflict in &report.conflicts {
                        println!(
                            "  - {}: '{}' (wanted '{}')",
                            conflict.label, conflict.existing, conflict.wanted
                        );
                    }
                    println!("Review these manually before reassigning.");
                }
            }
            CategoriesCommand::List {} => print_json(&app.catalog.categories()?)?,
        },

        Command::PurgeHashes { yes } => {
            let invalid = app.catalog.invalid_hashes()?;
            if invalid.is_empty() {
                println!("no invalid hashes found");
                return Ok(());
            }

            for record in &invalid {
                println!(
                    "item {}: {} chars",
                    record.item_id,
                    record.digest.chars().count()
                );
            }

            if !yes {
                let confirmed = inquire::prompt_confirmation(format!(
                    "delete {} invalid hashes? reprocess the photos afterwards to regenerate them (y/n)",
                    invalid.len()
                ))?;
                if !confirmed {
                    return Ok(());
                }
            }

            let purged = app.purge_invalid_hashes()?;
            println!("{purged} hashes deleted");
        }
    }

    Ok(())
}
