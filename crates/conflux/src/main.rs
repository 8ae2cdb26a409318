use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use conflux_core::config::ConfluxConfig;
use conflux_core::export::{ExportOptions, Exporter};
use conflux_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, bootstrap_config, resolve_paths,
};
use conflux_core::site::build_site;
use conflux_core::source::{ConfluenceClient, fetch_into_store};
use conflux_core::store::Store;
use tracing::{Level, debug, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(
    name = "conflux",
    version,
    about = "Mirror a wiki space into a static-site source tree"
)]
struct Cli {
    /// Directory holding config, cache and exports
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    /// Config file (defaults to <data-dir>/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, help = "Log at debug level")]
    debug: bool,
    #[arg(short, long, help = "Write a default config file if none exists")]
    create: bool,
    #[arg(
        short = 's',
        long = "fetch",
        visible_short_alias = '1',
        visible_alias = "slurp",
        help = "Fetch pages, blog posts and attachments into the local store"
    )]
    fetch: bool,
    #[arg(
        short = 'e',
        long = "export",
        visible_short_alias = '2',
        help = "Export the store as site generator input"
    )]
    export: bool,
    #[arg(
        short = 'p',
        long = "build-site",
        visible_short_alias = '3',
        visible_alias = "pelican",
        help = "Run the site generator over the exports"
    )]
    build_site: bool,
    #[arg(long, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install log subscriber")?;

    let context = ResolutionContext::from_process()?;
    let paths = resolve_paths(
        &context,
        &PathOverrides {
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
        },
    )?;
    debug!("config file is {}", normalize_path(&paths.config_path));

    let bootstrap = bootstrap_config(&paths, cli.create)?;
    if bootstrap.created {
        println!("created config: {}", normalize_path(&paths.config_path));
    }
    let config = bootstrap.config;

    if cli.fetch {
        run_fetch(&paths, &config)?;
    }
    if cli.export {
        run_export(&paths, &config)?;
    }
    if cli.build_site {
        run_build_site(&paths, &config)?;
    }
    if !(cli.fetch || cli.export || cli.build_site) {
        info!("no stage selected; pass --fetch, --export and/or --build-site");
    }
    if cli.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_fetch(paths: &ResolvedPaths, config: &ConfluxConfig) -> Result<()> {
    let settings = config.source_settings()?;
    info!(url = %settings.url, space = %settings.space, "fetching space");
    let mut client = ConfluenceClient::new(settings)?;
    let mut store = Store::open(paths)?;
    let report = fetch_into_store(&mut client, &mut store)?;
    let stats = store.stats()?;

    println!("fetch");
    println!("pages: {}", report.pages);
    println!("blog_posts: {}", report.blog_posts);
    println!("attachments_downloaded: {}", report.attachments_downloaded);
    println!("attachments_reused: {}", report.attachments_reused);
    println!("attachments_failed: {}", report.attachments_failed);
    println!("removed_content: {}", report.gc.content_removed);
    println!("removed_attachments: {}", report.gc.attachments_removed);
    println!("requests: {}", report.request_count);
    println!("stored_attachment_bytes: {}", stats.attachment_bytes);
    Ok(())
}

fn run_export(paths: &ResolvedPaths, config: &ConfluxConfig) -> Result<()> {
    let store = Store::open(paths)?;
    let report = Exporter::new(paths, ExportOptions::from_config(config)).export(&store)?;

    println!("export");
    println!("exports_dir: {}", normalize_path(&paths.exports_dir));
    println!("pages: {}", report.pages);
    println!("blog_posts: {}", report.blog_posts);
    println!("attachments_linked: {}", report.attachments_linked);
    println!("attachments_missing: {}", report.attachments_missing);
    println!("menu_entries: {}", report.menu_entries);
    println!("sections: {}", report.sections);
    println!("settings: {}", normalize_path(&report.settings_path));
    Ok(())
}

fn run_build_site(paths: &ResolvedPaths, config: &ConfluxConfig) -> Result<()> {
    let report = build_site(paths, config)?;

    println!("build-site");
    println!("program: {}", normalize_path(&report.program));
    println!("args: {}", report.args.join(" "));
    println!("elapsed_ms: {}", report.elapsed.as_millis());
    Ok(())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
