//! cryomon: fridge monitoring and upload daemon.

mod cli;
mod error_fmt;
mod registry;
mod run;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use eyre::Result;

use cli::{Cli, Commands, JSON_MODE};
use cryomon_config::Config;
use cryomon_core::time::{SystemWallClock, WallClock};
use cryomon_core::upload::UploadClient;

fn main() -> ExitCode {
    let args = Cli::parse();
    let _ = JSON_MODE.set(args.json);
    if let Err(e) = color_eyre::install() {
        eprintln!("error reporter init failed: {e}");
    }

    let mut cfg = match load(&args) {
        Ok(cfg) => cfg,
        Err(e) => return fail(&e, 2),
    };
    cli::init_tracing(&cfg.logging, args.json, args.log_level.as_deref());

    let result = match &args.cmd {
        Commands::Run { mock } => {
            if *mock {
                cfg.upload.mock = true;
            }
            // The master switch guards real posting; mock rehearsals are
            // always allowed.
            if !cfg.upload.enabled && !cfg.upload.mock {
                let e = eyre::eyre!(
                    "upload.enabled is false; enable it in the config or rehearse with `run --mock`"
                );
                return fail(&e, 2);
            }
            run::run(&cfg)
        }
        Commands::CheckConfig => check_config(&cfg),
        Commands::Latest => latest(&cfg),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e, error_fmt::exit_code_for_error(&e)),
    }
}

fn load(args: &Cli) -> Result<Config> {
    let cfg = cryomon_config::load_path(&args.config)?;
    cfg.validate()?;
    Ok(cfg)
}

fn check_config(cfg: &Config) -> Result<()> {
    println!(
        "config ok: fridge '{}' -> {}",
        cfg.upload.fridge, cfg.upload.base_url
    );
    for up in &cfg.uploaders {
        let state = if up.enabled() { "enabled" } else { "disabled" };
        match up.supp() {
            Some(supp) => println!("  {:<12} {state} (supp {supp})", up.kind()),
            None => println!("  {:<12} {state}", up.kind()),
        }
    }
    Ok(())
}

/// Query the store's newest timestamp for the main dataset and every supp
/// the enabled uploaders post to.
fn latest(cfg: &Config) -> Result<()> {
    let wall: Arc<dyn WallClock> = Arc::new(SystemWallClock);
    let mut targets: Vec<Option<String>> = vec![None];
    for up in cfg.uploaders.iter().filter(|u| u.enabled()) {
        let supp = up.supp().map(str::to_string);
        if supp.is_some() && !targets.contains(&supp) {
            targets.push(supp);
        }
    }
    for supp in targets {
        let mut client = UploadClient::new(&cfg.upload, supp.clone(), Arc::clone(&wall))?;
        client.seed_latest()?;
        let label = supp.as_deref().unwrap_or("(main)");
        if client.latest() == chrono::NaiveDateTime::default() {
            println!("{label:<16} no stored data");
        } else {
            println!("{label:<16} {}", client.latest());
        }
    }
    Ok(())
}

fn fail(err: &eyre::Report, code: i32) -> ExitCode {
    if JSON_MODE.get().copied().unwrap_or(false) {
        eprintln!("{}", error_fmt::format_error_json(err));
    } else {
        eprintln!("Error: {}", error_fmt::humanize(err));
    }
    ExitCode::from(code as u8)
}
