mod cache;
mod cli;
mod config;
mod driver;
mod error;
mod lock;
mod model;
mod ops;
mod recover;
mod resubmit;
mod store;
mod target;
mod ui;

use anyhow::Context;
use clap::Parser;
use console::Style;

use cache::StatusCache;
use cli::{Cli, Command};
use config::KongConfig;
use driver::{DriverRegistry, OutputStream};
use error::{KongError, Result};
use model::JobId;
use store::{ROOT_ID, Store};

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{} {err:#}", Style::new().red().bold().apply_to("error:"));
        std::process::exit(1);
    }
}

/// Resolves target expressions to job ids, warning about tokens that
/// matched nothing. Fails only when no token resolved at all; an existing
/// folder that happens to hold zero jobs yields an empty list, so commands
/// over it become no-ops rather than errors.
fn resolve_targets(
    state: &store::State,
    targets: &[String],
    recursive: bool,
) -> Result<Vec<JobId>> {
    let expr = targets.join(" ");
    let resolution = target::resolve(state, ROOT_ID, &expr, recursive);
    ui::print_unresolved(&resolution.unresolved);
    if resolution.is_empty() {
        if !resolution.unresolved.is_empty() {
            return Err(KongError::UnresolvedTarget(expr));
        }
        ui::print_empty_target(&expr);
    }
    Ok(resolution.jobs)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = KongConfig::load().context("loading kong.toml")?;
    let store = Store::new(&config);
    let cache = StatusCache::new(&config);
    let registry = DriverRegistry::standard(&config);

    match cli.command {
        Command::Mkdir {
            path,
            cores,
            memory_mb,
            queue,
            wall_time_mins,
        } => {
            let resources = model::ResourceRequest {
                cores,
                memory_mb,
                queue,
                wall_time_mins,
            };
            let id = store.transaction(|state| {
                let id = state.create_folder_path(ROOT_ID, &path)?;
                if !resources.is_empty() {
                    state.set_folder_resources(id, resources)?;
                }
                Ok(id)
            })?;
            let state = store.load()?;
            println!("{}", state.path_of(id)?);
        }

        Command::Ls {
            path,
            recursive,
            status,
        } => {
            let state = store.load()?;
            let folder = state.find_by_path(ROOT_ID, &path)?;
            let (folders, jobs) = state.list(folder.id, recursive)?;
            let statuses = if status {
                let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
                Some(ops::statuses_for(&store, &cache, &registry, &ids, cli.force)?)
            } else {
                None
            };
            for f in folders {
                ui::print_folder(f);
            }
            for job in jobs {
                let job_statuses = statuses
                    .as_ref()
                    .and_then(|s| s.get(&job.id))
                    .map(Vec::as_slice);
                ui::print_job(job, job_statuses);
            }
        }

        Command::Create {
            path,
            command,
            driver,
            array_size,
            cores,
            memory_mb,
            queue,
            wall_time_mins,
        } => {
            let driver = driver.unwrap_or_else(|| config.default_driver.clone());
            registry.get(&driver)?;
            let resources = model::ResourceRequest {
                cores,
                memory_mb,
                queue,
                wall_time_mins,
            };
            let id = store.transaction(|state| {
                let folder = state.find_by_path(ROOT_ID, &path)?.id;
                state.create_job(folder, &command, &driver, resources, array_size)
            })?;
            println!("{id}");
        }

        Command::Submit { targets, recursive } => {
            let state = store.load()?;
            for id in resolve_targets(&state, &targets, recursive)? {
                let job = ops::submit_job(&store, &registry, &config, id)?;
                println!(
                    "{id} submitted as {}",
                    job.external_id.as_deref().unwrap_or("?")
                );
            }
        }

        Command::Status { targets, recursive } => {
            let state = store.load()?;
            let ids = resolve_targets(&state, &targets, recursive)?;
            let statuses = ops::statuses_for(&store, &cache, &registry, &ids, cli.force)?;
            for (id, job_statuses) in &statuses {
                ui::print_status_line(*id, job_statuses);
            }
        }

        Command::Kill { targets, recursive } => {
            let state = store.load()?;
            for id in resolve_targets(&state, &targets, recursive)? {
                ops::kill_job(&store, &cache, &registry, id)?;
                println!("{id} kill requested");
            }
        }

        Command::Peek {
            job_id,
            subjob,
            stderr,
            tail,
        } => {
            let stream = if stderr {
                OutputStream::Stderr
            } else {
                OutputStream::Stdout
            };
            let output = ops::peek_job(&store, &registry, job_id, subjob, stream)?;
            match tail {
                Some(n) => {
                    let lines: Vec<&str> = output.lines().collect();
                    let start = lines.len().saturating_sub(n);
                    for line in &lines[start..] {
                        println!("{line}");
                    }
                }
                None => print!("{output}"),
            }
        }

        Command::Rm { targets, recursive } => {
            let state = store.load()?;
            let ids = resolve_targets(&state, &targets, recursive)?;
            ops::delete_jobs(&store, &cache, &registry, &config, &ids)?;
            println!("removed {} job(s)", ids.len());
        }

        Command::Rmdir { path, recursive } => {
            let removed = store.transaction(|state| {
                let id = state.find_by_path(ROOT_ID, &path)?.id;
                state.delete_folder(id, recursive)
            })?;
            // Jobs removed with the subtree take their artifacts along; the
            // folder is gone either way, so report that before any cleanup
            // failure surfaces.
            let cleanup = ops::cleanup_removed_jobs(&cache, &registry, &config, &removed);
            println!("removed {path} ({} job(s))", removed.len());
            cleanup?;
        }

        Command::Mv { source, dest } => {
            store.transaction(|state| {
                let dest_id = state.find_by_path(ROOT_ID, &dest)?.id;
                if let Ok(job_id) = source.parse::<JobId>() {
                    state.move_job(job_id, dest_id)
                } else {
                    let folder_id = state.find_by_path(ROOT_ID, &source)?.id;
                    state.move_folder(folder_id, dest_id)
                }
            })?;
        }

        Command::Resubmit {
            targets,
            status,
            recursive,
        } => {
            let state = store.load()?;
            let ids = resolve_targets(&state, &targets, recursive)?;
            let outcome = resubmit::resubmit(
                &store, &cache, &registry, &config, &ids, &status, cli.force,
            )?;
            for (original, replacement) in &outcome.resubmitted {
                println!("{original} resubmitted as {replacement}");
            }
            for id in &outcome.skipped {
                eprintln!("{id} skipped: command unknown");
            }
            if outcome.resubmitted.is_empty() {
                println!("nothing to resubmit");
            }
        }

        Command::Recover { job_id, driver } => {
            let job = recover::recover_job(&store, &cache, &registry, job_id, &driver)?;
            println!(
                "{} recovered as {} in /recovered",
                job.id,
                job.external_id.as_deref().unwrap_or("?")
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceRequest;

    /// root with one empty folder and one folder holding job 1.
    fn fixture() -> store::State {
        let mut state = store::State::default();
        let full = state.create_folder(ROOT_ID, "full").unwrap();
        state.create_folder(ROOT_ID, "empty").unwrap();
        state
            .create_job(full, "true", "local", ResourceRequest::default(), 1)
            .unwrap();
        state
    }

    #[test]
    fn empty_folder_target_resolves_to_no_jobs() {
        let state = fixture();
        let ids = resolve_targets(&state, &["/empty".to_string()], true).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn fully_unresolved_target_errors() {
        let state = fixture();
        let err = resolve_targets(&state, &["/no/such".to_string()], false).unwrap_err();
        assert!(matches!(err, KongError::UnresolvedTarget(_)));
    }

    #[test]
    fn partial_resolution_returns_the_matches() {
        let state = fixture();
        let ids =
            resolve_targets(&state, &["/full".to_string(), "999".to_string()], true).unwrap();
        assert_eq!(ids, vec![1]);
    }
}
