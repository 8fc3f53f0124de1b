//! mobundle: git-like bundle workflow for model code and data
//!
//! Packages tracked files as OCI artifacts with content-addressed
//! deduplication: small files as registry layers, large ones in external
//! blob storage, everything identified by SHA-256.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{builder::Styles, Parser, Subcommand};
use tracing::info;

use mobundle_core::{
    apply_pull, apply_push, bundle_status, compute_diff, plan_pull, plan_push, scan_workspace,
    status_summary, ApplyOptions, BundleConfig, BundleError, BundleIndex, BundlePath,
    BundleStatus, IgnoreMatcher, LocalCas, OciManifest, ProjectContext, PullOptions, RemoteState,
    TrackedSnapshot,
};
use mobundle_store::{make_blob_store, make_registry};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "mobundle")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Version model code and data as OCI artifacts")]
#[command(long_about = r"
mobundle tracks model code and data files and syncs them with an OCI
registry, git-style:

  mobundle init file:///srv/registry/models   Initialize a project
  mobundle add src/ data/weights.bin          Track files
  mobundle push                               Publish the tracked set
  mobundle pull                               Mirror the remote locally
  mobundle status                             Compare tree, registry, last sync
")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a bundle project in the current directory
    Init {
        /// Registry reference, e.g. file:///srv/registry/models
        registry_ref: String,

        /// Blob storage provider (fs, azure, s3, gcs)
        #[arg(long)]
        provider: Option<String>,

        /// Blob container / bucket (a directory for fs)
        #[arg(long)]
        container: Option<String>,
    },

    /// Track files or directories
    Add {
        /// Paths to track
        paths: Vec<PathBuf>,

        /// Track even if the path matches ignore rules
        #[arg(short, long)]
        force: bool,
    },

    /// Stop tracking files or directories
    Remove {
        /// Paths to untrack
        paths: Vec<PathBuf>,
    },

    /// Show how the working tree relates to the registry
    Status,

    /// Publish the tracked set to the registry
    Push {
        /// Tag to push (defaults to the configured tag)
        #[arg(short, long)]
        tag: Option<String>,

        /// Push even if the tag moved since the last sync
        #[arg(short, long)]
        force: bool,
    },

    /// Mirror a bundle version into the working tree
    Pull {
        /// Tag or sha256:<digest> (defaults to the configured tag)
        reference: Option<String>,

        /// Proceed even if local changes would be overwritten or deleted
        #[arg(long)]
        overwrite: bool,

        /// Also delete locally-added files not present in the bundle
        #[arg(long)]
        mirror: bool,
    },

    /// List tags in the registry
    Tags,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = color_eyre::install();
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(command: Commands) -> Result<(), BundleError> {
    match command {
        Commands::Init {
            registry_ref,
            provider,
            container,
        } => init_command(&registry_ref, provider, container),
        Commands::Add { paths, force } => add_command(&paths, force),
        Commands::Remove { paths } => remove_command(&paths),
        Commands::Status => status_command().await,
        Commands::Push { tag, force } => push_command(tag, force).await,
        Commands::Pull {
            reference,
            overwrite,
            mirror,
        } => pull_command(reference, overwrite, mirror).await,
        Commands::Tags => tags_command().await,
    }
}

fn project() -> Result<ProjectContext, BundleError> {
    ProjectContext::discover(&std::env::current_dir()?)
}

fn init_command(
    registry_ref: &str,
    provider: Option<String>,
    container: Option<String>,
) -> Result<(), BundleError> {
    let mut config = BundleConfig::new(registry_ref);
    if let Some(provider) = provider {
        config.storage.provider = provider;
    }
    if let Some(container) = container {
        config.storage.container = container;
    }

    let root = std::env::current_dir()?;
    ProjectContext::init(&root, &config)?;
    println!("Initialized bundle project for {registry_ref}");
    Ok(())
}

fn add_command(paths: &[PathBuf], force: bool) -> Result<(), BundleError> {
    let ctx = project()?;
    let _lock = ctx.lock()?;
    let matcher = IgnoreMatcher::new(ctx.root(), &[])?;
    let mut tracked = ctx.load_tracked()?;

    let mut added = 0;
    for path in paths {
        for bundle_path in expand_path(&ctx, &matcher, path)? {
            if tracked.add(bundle_path.clone(), &matcher, force)? {
                info!(path = %bundle_path, "tracked");
                added += 1;
            }
        }
    }
    tracked.save(&ctx.tracked_path())?;
    println!("Tracking {added} new file(s), {} total", tracked.len());
    Ok(())
}

fn remove_command(paths: &[PathBuf]) -> Result<(), BundleError> {
    let ctx = project()?;
    let _lock = ctx.lock()?;
    let mut tracked = ctx.load_tracked()?;

    let mut removed = 0;
    for path in paths {
        let bundle_path = ctx.to_bundle_path(path)?;
        // A directory argument untracks everything beneath it
        let prefix = format!("{bundle_path}/");
        let victims: Vec<BundlePath> = tracked
            .iter()
            .filter(|p| **p == bundle_path || p.as_str().starts_with(&prefix))
            .cloned()
            .collect();
        for victim in victims {
            tracked.remove(&victim);
            removed += 1;
        }
    }
    tracked.save(&ctx.tracked_path())?;
    println!("Untracked {removed} file(s), {} remain", tracked.len());
    Ok(())
}

/// A file argument maps to itself; a directory argument maps to every
/// non-ignored file beneath it.
fn expand_path(
    ctx: &ProjectContext,
    matcher: &IgnoreMatcher,
    path: &PathBuf,
) -> Result<Vec<BundlePath>, BundleError> {
    if path.is_dir() {
        let bundle_path = ctx.to_bundle_path(path)?;
        let prefix = format!("{bundle_path}/");
        let entries = scan_workspace(ctx.root(), matcher)?;
        Ok(entries
            .into_iter()
            .map(|e| e.path)
            .filter(|p| p.as_str().starts_with(&prefix))
            .collect())
    } else {
        Ok(vec![ctx.to_bundle_path(path)?])
    }
}

async fn status_command() -> Result<(), BundleError> {
    let ctx = project()?;
    let config = ctx.load_config()?;
    let tracked = ctx.load_tracked()?;
    let state = ctx.load_state()?;
    let matcher = IgnoreMatcher::new(ctx.root(), &[])?;

    let snapshot = TrackedSnapshot::scan(&tracked, ctx.root())?;
    let inventory = scan_workspace(ctx.root(), &matcher)?;

    // Status works offline: any failure to reach the registry is UNKNOWN,
    // not an error
    let remote = match make_registry(&config.registry_ref) {
        Ok(registry) => match registry.resolve_tag(&config.default_tag).await {
            Ok(Some(resolved)) => {
                match fetch_remote_index(registry.as_ref(), &resolved.manifest).await {
                    Ok(index) => Some(RemoteState::from_index(resolved.digest, &index)),
                    Err(_) => None,
                }
            }
            Ok(None) => Some(RemoteState::absent()),
            Err(_) => None,
        },
        Err(_) => None,
    };

    let diff = compute_diff(&snapshot, remote.as_ref().unwrap_or(&RemoteState::absent()), &state);
    let summary = status_summary(&diff, remote.as_ref(), &state, &tracked, &inventory);
    let status = bundle_status(&diff, remote.as_ref(), &state);

    println!(
        "On bundle {}:{}",
        config.registry_ref, config.default_tag
    );
    println!("State: {}", describe_status(status));
    println!(
        "Tracked: {} file(s), {} bytes",
        summary.total_tracked, summary.total_size
    );
    for (label, count) in [
        ("unchanged", summary.unchanged),
        ("added locally", summary.added_local),
        ("modified locally", summary.modified_local),
        ("deleted locally", summary.deleted_local),
        ("added on remote", summary.added_remote),
        ("modified on remote", summary.modified_remote),
        ("deleted on remote", summary.deleted_remote),
        ("conflicting", summary.conflicts),
    ] {
        if count > 0 {
            println!("  {count} {label}");
        }
    }
    if !summary.untracked.is_empty() {
        println!("Untracked files: {}", summary.untracked.len());
    }
    Ok(())
}

fn describe_status(status: BundleStatus) -> &'static str {
    match status {
        BundleStatus::Clean => "clean (in sync)",
        BundleStatus::LocalChanges => "local changes",
        BundleStatus::Behind => "behind remote (pull to update)",
        BundleStatus::Ahead => "ahead of remote (push to publish)",
        BundleStatus::Diverged => "diverged (pull, reconcile, then push)",
        BundleStatus::Unknown => "unknown (registry unreachable)",
    }
}

async fn push_command(tag: Option<String>, force: bool) -> Result<(), BundleError> {
    let ctx = project()?;
    let _lock = ctx.lock()?;
    let config = ctx.load_config()?;
    let tag = tag.unwrap_or_else(|| config.default_tag.clone());

    let registry = make_registry(&config.registry_ref)?;
    let blob_store = make_blob_store(&config.storage)?;
    let policy = config.storage_policy()?;

    let tracked = ctx.load_tracked()?;
    let state = ctx.load_state()?;
    let snapshot = TrackedSnapshot::scan(&tracked, ctx.root())?;

    let plan = plan_push(
        registry.as_ref(),
        blob_store.as_deref(),
        &policy,
        &snapshot,
        &state,
        &tag,
        force,
    )
    .await?;

    if plan.is_noop() {
        let digest = plan.previous_digest.expect("noop plans have a previous digest");
        println!("Up to date: {digest}");
        return Ok(());
    }

    println!(
        "Pushing {} file(s), {} byte(s) to upload, {} to delete",
        plan.index.files.len(),
        plan.total_upload_size(),
        plan.deletes.len()
    );

    let opts = apply_options();
    let digest = apply_push(&ctx, registry, blob_store, &plan, &opts).await?;
    println!("Pushed {}:{tag}", config.registry_ref);
    println!("Digest: {digest}");
    Ok(())
}

async fn pull_command(
    reference: Option<String>,
    overwrite: bool,
    mirror: bool,
) -> Result<(), BundleError> {
    let ctx = project()?;
    let _lock = ctx.lock()?;
    let config = ctx.load_config()?;
    let reference = reference.unwrap_or_else(|| config.default_tag.clone());

    let registry = make_registry(&config.registry_ref)?;
    let blob_store = make_blob_store(&config.storage)?;
    let cas = LocalCas::open(config.cache_dir.clone())?;

    let tracked = ctx.load_tracked()?;
    let state = ctx.load_state()?;
    let snapshot = TrackedSnapshot::scan(&tracked, ctx.root())?;

    let plan = plan_pull(
        registry.as_ref(),
        &snapshot,
        &tracked,
        &state,
        ctx.root(),
        &reference,
        PullOptions { overwrite, mirror },
    )
    .await?;

    println!(
        "Pulling {} file(s), {} byte(s) to download",
        plan.fetches.len(),
        plan.total_download_size()
    );

    let opts = apply_options();
    let report = apply_pull(&ctx, registry, blob_store, &cas, &plan, &opts).await?;
    println!(
        "Pulled {} file(s), deleted {} at {}",
        report.downloaded, report.deleted, report.manifest_digest
    );
    Ok(())
}

async fn tags_command() -> Result<(), BundleError> {
    let ctx = project()?;
    let config = ctx.load_config()?;
    let registry = make_registry(&config.registry_ref)?;

    for tag in registry.list_tags().await? {
        println!("{tag}");
    }
    Ok(())
}

/// Apply options with Ctrl-C wired to the cancellation token.
fn apply_options() -> ApplyOptions {
    let opts = ApplyOptions::default();
    let cancel = opts.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, aborting transfers...");
            cancel.cancel();
        }
    });
    opts
}

/// Fetch and parse the bundle index a manifest's config descriptor points at.
async fn fetch_remote_index(
    registry: &dyn mobundle_core::Registry,
    manifest_bytes: &[u8],
) -> Result<BundleIndex, BundleError> {
    let manifest = OciManifest::from_slice(manifest_bytes)?;
    let bytes = mobundle_core::remote::fetch_blob_bytes(registry, &manifest.config.digest).await?;
    BundleIndex::from_slice(&bytes)
}
