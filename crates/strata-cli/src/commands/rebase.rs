use super::{json_pretty, spin_fail, spin_ok, spinner, user, CommandError, EXIT_SUCCESS};
use std::path::PathBuf;
use strata_core::{ExitKind, Platform, RebaseReport, RebaseRequest, Rebaser, Target};
use strata_image::{ImageStore, Keychain, LocalStore, RegistryClient};

#[derive(Debug, Clone)]
pub struct RebaseArgs {
    pub images: Vec<String>,
    pub run_image: Option<String>,
    pub daemon: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub store: PathBuf,
    pub report: Option<PathBuf>,
    pub insecure_registries: Vec<String>,
}

fn open_store(args: &RebaseArgs) -> Result<Box<dyn ImageStore>, String> {
    if args.daemon {
        return Ok(Box::new(LocalStore::new(&args.store)));
    }
    let keychain = Keychain::from_env().map_err(|e| format!("failed to read credentials: {e}"))?;
    Ok(Box::new(
        RegistryClient::new(keychain).with_insecure(args.insecure_registries.iter().cloned()),
    ))
}

pub fn run(platform: &Platform, args: &RebaseArgs, json: bool) -> Result<u8, CommandError> {
    let failed = |message: String| CommandError::new(platform.code_for(ExitKind::Failed), message);

    user::run_as(args.uid, args.gid).map_err(failed)?;
    let store = open_store(args).map_err(failed)?;

    let request = RebaseRequest {
        images: args.images.clone(),
        run_image: args.run_image.clone(),
        target: if args.daemon {
            Target::Daemon
        } else {
            Target::Registry
        },
    };

    let label = args.images.first().map_or("image", String::as_str);
    let pb = spinner(&format!("rebasing {label}..."));
    let report = match Rebaser::new(store.as_ref(), platform).run(&request) {
        Ok(report) => {
            spin_ok(&pb, &format!("rebased {label}"));
            report
        }
        Err(e) => {
            spin_fail(&pb, "rebase failed");
            return Err(CommandError::new(e.exit_code(platform), e.to_string()));
        }
    };

    if let Some(path) = &args.report {
        report.write_toml(path).map_err(|e| failed(e.to_string()))?;
    }

    if json {
        println!("{}", json_pretty(&report).map_err(failed)?);
    } else {
        print_report(&report);
    }
    Ok(EXIT_SUCCESS)
}

fn print_report(report: &RebaseReport) {
    println!("app image:  {}", report.app_image);
    println!("run image:  {}", report.run_image_reference);
    println!(
        "top layer:  {} -> {}",
        report.previous_top_layer, report.new_top_layer
    );
    println!(
        "layers:     {} base replaced by {}, {} app kept",
        report.replaced_layers, report.base_layers, report.app_layers
    );
    for saved in &report.saved {
        println!("saved:      {} ({})", saved.name, saved.digest);
    }
}
