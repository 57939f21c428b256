use std::{process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use hondana_kernel::{
    engine::Engine,
    ingest::compress::SidecarOptions,
    local::storage::Storage,
    model::ProviderId,
    rt::backup::{BackupProduct, BackupRequest, BackupTarget},
};
use hondana_tracing::{TracingConsumer, init_tracing};
use tokio::{select, signal::ctrl_c};
use url::Url;

mod config;
mod render;

use config::Config;

const EXIT_FAILURE: u8 = 1;
const EXIT_CANCELLED: u8 = 2;

#[derive(Parser)]
#[command(version, about = "Offline-first manga library with cloud sync", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest local archive files into the library
    Ingest {
        /// Archive files (`.cbz`/`.zip`); the parent directory names the series
        files: Vec<std::path::PathBuf>,
        /// Series title override
        #[arg(long)]
        series: Option<String>,
    },
    /// Fetch an archive (and its sidecars) from a URL and ingest it
    ImportUrl {
        #[arg(long)]
        source: Url,
        /// Series title
        #[arg(long)]
        manga: Option<String>,
        /// Volume title
        #[arg(long)]
        volume: Option<String>,
    },
    /// Show the derived catalog (locals and placeholders)
    List {
        /// Refresh remote listings first
        #[arg(long)]
        refresh: bool,
    },
    /// Refresh remote listings into the cache
    Refresh {
        #[arg(long)]
        provider: Option<ProviderId>,
    },
    /// Download placeholder volumes from their providers
    Download {
        /// `Series/Volume` selectors or volume uuids
        selectors: Vec<String>,
        /// Download every placeholder
        #[arg(long)]
        all: bool,
    },
    /// Compress volumes out of the library and upload them
    Backup {
        selectors: Vec<String>,
        #[arg(long)]
        provider: ProviderId,
        /// Back up every local volume
        #[arg(long)]
        all: bool,
        #[arg(long)]
        include_sidecars: bool,
        /// Put sidecars inside the archive instead of next to it
        #[arg(long)]
        embed_sidecars: bool,
    },
    /// Compress volumes into local `.cbz` files
    Export {
        selectors: Vec<String>,
        #[arg(long, default_value = ".")]
        out: std::path::PathBuf,
        #[arg(long)]
        include_sidecars: bool,
        #[arg(long)]
        embed_sidecars: bool,
    },
    /// Merge duplicate sibling folders on a provider
    Dedup {
        #[arg(long)]
        provider: ProviderId,
    },
    /// Remove a volume from the library
    Remove {
        selector: String,
        /// Also delete the archive and its sidecars from the cloud
        #[arg(long)]
        remote: bool,
    },
    /// Provider authentication and status
    #[command(subcommand)]
    Provider(ProviderCommand),
    /// Reading stats for one volume or the whole library
    Stats { selector: Option<String> },
}

#[derive(Subcommand)]
enum ProviderCommand {
    Login {
        provider: ProviderId,
        /// Token or account key; omit to re-validate stored credentials
        #[arg(long, env = "HONDANA_SECRET")]
        secret: Option<String>,
    },
    Logout {
        provider: ProviderId,
    },
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing(TracingConsumer::Tool);
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    select! {
        code = run(cli, config) => code,
        _ = ctrl_c() => {
            eprintln!("cancelled");
            ExitCode::from(EXIT_CANCELLED)
        }
    }
}

async fn run(cli: Cli, config: Config) -> ExitCode {
    let storage = match Storage::open(config.data_dir()) {
        Ok(storage) => Arc::new(storage),
        Err(err) => {
            eprintln!("error: failed to open library: {}", err.ctx());
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let engine = match Engine::new(storage, config.engine_config()) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("error: {}", err.ctx());
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match dispatch(&engine, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn dispatch(engine: &Engine, command: Command) -> Result<(), String> {
    match command {
        Command::Ingest { files, series } => {
            if files.is_empty() {
                return Err("no files given".into());
            }
            let mut failed = 0;
            for file in files {
                let data = std::fs::read(&file)
                    .map_err(|err| format!("{}: {err}", file.display()))?;
                let base_path = render::base_path_for(&file, series.as_deref());
                for report in engine.ingest_archive(&base_path, &data) {
                    match report.result {
                        Ok(outcome) => {
                            println!("ingested {} ({outcome:?})", report.source);
                        }
                        Err(err) => {
                            failed += 1;
                            eprintln!("failed {}: {}", report.source, err.ctx());
                        }
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{failed} volume(s) failed"));
            }
            Ok(())
        }

        Command::ImportUrl { source, manga, volume } => {
            let reports = engine
                .import_url(&source, manga.as_deref(), volume.as_deref())
                .await
                .map_err(|err| err.ctx().to_string())?;
            let mut failed = 0;
            for report in reports {
                match report.result {
                    Ok(outcome) => println!("ingested {} ({outcome:?})", report.source),
                    Err(err) => {
                        failed += 1;
                        eprintln!("failed {}: {}", report.source, err.ctx());
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{failed} volume(s) failed"));
            }
            Ok(())
        }

        Command::List { refresh } => {
            if refresh {
                engine
                    .refresh(None)
                    .await
                    .map_err(|err| err.ctx().to_string())?;
            }
            let catalog = engine.catalog().map_err(|err| err.ctx().to_string())?;
            render::print_catalog(&catalog);
            Ok(())
        }

        Command::Refresh { provider } => {
            engine
                .refresh(provider.as_ref())
                .await
                .map_err(|err| err.ctx().to_string())?;
            Ok(())
        }

        Command::Download { selectors, all } => {
            let outcomes = if all {
                engine
                    .download_all_placeholders()
                    .await
                    .map_err(|err| err.ctx().to_string())?
            } else {
                if selectors.is_empty() {
                    return Err("no volumes selected (use --all for everything)".into());
                }
                let reconciliation =
                    engine.reconcile().map_err(|err| err.ctx().to_string())?;
                for selector in &selectors {
                    let uuid = engine
                        .resolve_selector(selector)
                        .map_err(|err| err.ctx().to_string())?
                        .ok_or_else(|| format!("unknown volume: {selector}"))?;
                    let placeholder = reconciliation
                        .volumes
                        .iter()
                        .find(|v| v.volume_uuid == uuid && v.is_placeholder())
                        .ok_or_else(|| format!("{selector} is not a cloud placeholder"))?;
                    engine.downloads().enqueue(placeholder);
                }
                engine.downloads().drain().await
            };
            let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
            println!("downloaded {} volume(s)", outcomes.len() - failed);
            if failed > 0 {
                return Err(format!("{failed} download(s) failed"));
            }
            Ok(())
        }

        Command::Backup { selectors, provider, all, include_sidecars, embed_sidecars } => {
            let opts = SidecarOptions { include_sidecars, embed_sidecars };
            let uuids = render::select_local_volumes(engine, &selectors, all)?;
            let requests = uuids
                .into_iter()
                .map(|volume_uuid| BackupRequest {
                    volume_uuid,
                    target: BackupTarget::Provider(provider.clone()),
                    opts,
                })
                .collect();
            let outcomes = engine.run_backups(requests).await;
            let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
            println!("backed up {} volume(s)", outcomes.len() - failed);
            if failed > 0 {
                return Err(format!("{failed} backup(s) failed"));
            }
            Ok(())
        }

        Command::Export { selectors, out, include_sidecars, embed_sidecars } => {
            let opts = SidecarOptions { include_sidecars, embed_sidecars };
            let uuids = render::select_local_volumes(engine, &selectors, false)?;
            let requests = uuids
                .into_iter()
                .map(|volume_uuid| BackupRequest {
                    volume_uuid,
                    target: BackupTarget::Export,
                    opts,
                })
                .collect();
            std::fs::create_dir_all(&out).map_err(|err| err.to_string())?;
            let outcomes = engine.run_backups(requests).await;
            let mut failed = 0;
            for outcome in outcomes {
                match outcome.result {
                    Ok(BackupProduct::Exported(compressed)) => {
                        let target = out.join(&compressed.file_name);
                        std::fs::write(&target, &compressed.archive)
                            .map_err(|err| err.to_string())?;
                        for (name, data) in &compressed.sidecars {
                            std::fs::write(out.join(name), data)
                                .map_err(|err| err.to_string())?;
                        }
                        println!("wrote {}", target.display());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        failed += 1;
                        eprintln!("export of {} failed: {}", outcome.volume_uuid, err.ctx());
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{failed} export(s) failed"));
            }
            Ok(())
        }

        Command::Dedup { provider } => {
            let report = engine
                .dedupe_folders(&provider)
                .await
                .map_err(|err| err.ctx().to_string())?;
            println!(
                "merged {} duplicate group(s) in {} pass(es); {} file(s) and {} folder(s) removed",
                report.groups_resolved, report.passes, report.files_deleted, report.folders_deleted
            );
            Ok(())
        }

        Command::Remove { selector, remote } => {
            let uuid = engine
                .resolve_selector(&selector)
                .map_err(|err| err.ctx().to_string())?
                .ok_or_else(|| format!("unknown volume: {selector}"))?;
            engine
                .remove_volume(&uuid, remote)
                .await
                .map_err(|err| err.ctx().to_string())?;
            println!("removed {selector}");
            Ok(())
        }

        Command::Provider(command) => match command {
            ProviderCommand::Login { provider, secret } => {
                let store = engine.provider(&provider).map_err(|err| err.ctx().to_string())?;
                store
                    .login(secret.as_deref())
                    .await
                    .map_err(|err| err.ctx().to_string())?;
                println!("{provider}: signed in");
                Ok(())
            }
            ProviderCommand::Logout { provider } => {
                engine.logout(&provider).map_err(|err| err.ctx().to_string())?;
                println!("{provider}: signed out");
                Ok(())
            }
            ProviderCommand::Status => {
                for (id, status) in engine.provider_status() {
                    render::print_provider_status(&id, &status);
                }
                Ok(())
            }
        },

        Command::Stats { selector } => {
            render::print_stats(engine, selector.as_deref())
        }
    }
}
