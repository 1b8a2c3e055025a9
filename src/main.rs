use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use term_plan_scraper::config::{DEFAULT_INSURER, DEFAULT_LISTING_URL};
use term_plan_scraper::{
    ApplicantProfile, ChromeLauncher, JsonFileSink, Pipeline, ScraperConfig, SiteLayout,
};

#[derive(Parser)]
#[command(name = "term-plan-scraper")]
#[command(about = "Scrape term-insurance plans, riders and quotes into a JSON file")]
struct Cli {
    /// Output JSON file
    #[arg(long, env = "TERM_SCRAPER_OUTPUT", default_value = "final_parsed_term_plans.json")]
    output: PathBuf,

    /// Plans listing page
    #[arg(long, env = "TERM_SCRAPER_LISTING_URL", default_value = DEFAULT_LISTING_URL)]
    listing_url: String,

    #[arg(long, env = "TERM_SCRAPER_INSURER", default_value = DEFAULT_INSURER)]
    insurer: String,

    /// Applicant profile JSON (age, gender, annualIncome, coverAmount, termYears, smoker, contact)
    #[arg(long, env = "TERM_SCRAPER_PROFILE")]
    profile: Option<PathBuf>,

    /// Site layout JSON replacing the built-in selectors
    #[arg(long, env = "TERM_SCRAPER_LAYOUT")]
    layout: Option<PathBuf>,

    /// Show the browser window
    #[arg(long, env = "TERM_SCRAPER_HEADED")]
    headed: bool,

    /// Verbose logs and failure screenshots
    #[arg(long, env = "TERM_SCRAPER_DEBUG")]
    debug: bool,

    /// Chrome/Chromium executable
    #[arg(long, env = "TERM_SCRAPER_CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// Process only the first N plans
    #[arg(long, env = "TERM_SCRAPER_LIMIT")]
    limit: Option<usize>,

    /// Parallel browser sessions
    #[arg(long, env = "TERM_SCRAPER_SESSIONS", default_value_t = 1)]
    sessions: usize,

    #[arg(long, env = "TERM_SCRAPER_PLAN_TIMEOUT_SECS", default_value_t = 180)]
    plan_timeout_secs: u64,

    /// Wall-clock limit for the whole run
    #[arg(long, env = "TERM_SCRAPER_RUN_TIMEOUT_SECS")]
    run_timeout_secs: Option<u64>,

    /// Write the run summary JSON here
    #[arg(long, env = "TERM_SCRAPER_SUMMARY")]
    summary: Option<PathBuf>,
}

impl Cli {
    fn scraper_config(&self) -> Result<ScraperConfig> {
        let mut config = ScraperConfig::new(&self.listing_url)
            .with_insurer(&self.insurer)
            .with_headless(!self.headed)
            .with_debug(self.debug)
            .with_limit(self.limit)
            .with_sessions(self.sessions)
            .with_plan_timeout(Duration::from_secs(self.plan_timeout_secs))
            .with_run_timeout(self.run_timeout_secs.map(Duration::from_secs));

        if let Some(path) = &self.chrome_path {
            config = config.with_chrome_path(path);
        }
        if let Some(path) = &self.profile {
            let profile = ApplicantProfile::from_json_file(path)
                .with_context(|| format!("failed to load profile {}", path.display()))?;
            config = config.with_profile(profile);
        }
        if let Some(path) = &self.layout {
            let layout = SiteLayout::from_json_file(path)
                .with_context(|| format!("failed to load layout {}", path.display()))?;
            config = config.with_layout(layout);
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "info,term_plan_scraper=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let config = cli.scraper_config()?;
    info!(
        "Scraping {} (sessions={}, limit={:?})",
        config.listing_url, config.sessions, config.limit
    );

    let launcher = ChromeLauncher::new(config.clone());
    let pipeline = Pipeline::new(launcher, config).context("invalid site layout")?;
    let sink = JsonFileSink::new(&cli.output);

    let summary = pipeline.run(&sink).await.context("scrape run aborted")?;

    // レコードは書き出し済みなので、サマリーの失敗では終了コードを変えない
    if let Some(path) = &cli.summary {
        if let Err(e) = summary.write_json(path) {
            warn!("Failed to write summary {}: {}", path.display(), e);
        }
    }

    info!(
        "Saved {} of {} plans to {}",
        summary.produced,
        summary.attempted,
        cli.output.display()
    );
    Ok(())
}
