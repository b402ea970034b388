use anyhow::{anyhow, Context};
use clap::Parser;
use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::encode::pattern::PatternEncoder;
use robotcheck::crawl::{self, HttpTransport, Resolution, DEFAULT_UA};
use robotcheck::robot::glyphs::GlyphSet;
use robotcheck::robot::{RobotMiddleware, Settings};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

const APP_NAME: &str = "robotcheck";

#[derive(Default, Debug, Serialize, Deserialize)]
struct Profile {
    #[serde(default)]
    glyph_dir: Option<String>,
    #[serde(default)]
    max_retry: Option<u32>,
    #[serde(default)]
    threshold: Option<u8>,
    #[serde(default)]
    min_width: Option<u32>,
    #[serde(default)]
    answer_field: Option<String>,
    #[serde(default)]
    challenge_phrase: Option<String>,
    #[serde(default)]
    user_agent: Option<String>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct MyConfig {
    profiles: HashMap<String, Profile>,
}

#[derive(Parser)]
#[command(name = "robotcheck")]
#[command(version = "0.1.0")]
#[command(about = "Fetch pages, solving Robot Check captchas on the way")]
struct Opts {
    /// Pages to fetch
    urls: Vec<String>,
    #[arg(short, long, env = "ROBOTCHECK_GLYPH_DIR")]
    glyph_dir: Option<PathBuf>,
    #[arg(long, env = "ROBOTCHECK_MAX_RETRY")]
    max_retry: Option<u32>,
    #[arg(long)]
    threshold: Option<u8>,
    #[arg(long)]
    min_width: Option<u32>,
    #[arg(long)]
    answer_field: Option<String>,
    #[arg(long)]
    challenge_phrase: Option<String>,
    #[arg(long)]
    user_agent: Option<String>,
    #[arg(short, long, default_value = "4")]
    workers: usize,
    #[arg(short, long, env = "ROBOTCHECK_PROXY_URL")]
    socks_proxy_url: Option<String>,
    /// Decode a single captcha image and print the guess
    #[arg(long)]
    solve: Option<PathBuf>,
    #[arg(short = 'c', long, default_value = "default")]
    profile: String,
    #[arg(long, default_value = "robotcheck.log")]
    log_file: String,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(path: &str, level: &str) -> anyhow::Result<()> {
    let level = LevelFilter::from_str(level).map_err(|_| anyhow!("bad log level {}", level))?;
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d} {l} {t} - {m}{n}")))
        .build(path)?;

    let config = log4rs::config::Config::builder()
        .appender(log4rs::config::Appender::builder().build("logfile", Box::new(logfile)))
        .build(
            log4rs::config::Root::builder()
                .appender("logfile")
                .build(level),
        )?;

    log4rs::init_config(config)?;
    Ok(())
}

fn load_profile(name: &str) -> Profile {
    match confy::load::<MyConfig>(APP_NAME, None) {
        Ok(mut cfg) => cfg.profiles.remove(name).unwrap_or_default(),
        Err(err) => {
            log::warn!("config not loaded: {}", err);
            Profile::default()
        }
    }
}

fn settings(opts: &Opts, profile: &Profile) -> Settings {
    let defaults = Settings::default();
    Settings {
        threshold: opts.threshold.or(profile.threshold).unwrap_or(defaults.threshold),
        min_width: opts.min_width.or(profile.min_width).unwrap_or(defaults.min_width),
        max_retry: opts.max_retry.or(profile.max_retry).unwrap_or(defaults.max_retry),
        answer_field: opts
            .answer_field
            .clone()
            .or_else(|| profile.answer_field.clone())
            .unwrap_or(defaults.answer_field),
        challenge_phrase: opts
            .challenge_phrase
            .clone()
            .or_else(|| profile.challenge_phrase.clone())
            .unwrap_or(defaults.challenge_phrase),
    }
}

fn main() -> anyhow::Result<()> {
    let opts: Opts = Opts::parse();
    init_logging(&opts.log_file, &opts.log_level)?;

    if let Ok(config_path) = confy::get_configuration_file_path(APP_NAME, None) {
        log::info!("Config path: {:?}", config_path);
    }
    let profile = load_profile(&opts.profile);
    let settings = settings(&opts, &profile);

    let glyph_dir = opts
        .glyph_dir
        .clone()
        .or_else(|| profile.glyph_dir.as_ref().map(PathBuf::from))
        .ok_or_else(|| anyhow!("no glyph directory, pass --glyph-dir or set it in the profile"))?;
    let glyphs = GlyphSet::load(&glyph_dir, settings.threshold)
        .with_context(|| format!("loading glyphs from {}", glyph_dir.display()))?;
    let middleware = Arc::new(RobotMiddleware::new(settings, Arc::new(glyphs))?);

    if let Some(path) = &opts.solve {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        println!("{}", middleware.solve(&bytes)?);
        return Ok(());
    }

    let ua = opts
        .user_agent
        .clone()
        .or_else(|| profile.user_agent.clone())
        .unwrap_or_else(|| DEFAULT_UA.to_owned());
    let transport = Arc::new(HttpTransport::new(&ua, opts.socks_proxy_url.as_deref())?);

    for (url, res) in crawl::crawl(transport, middleware.clone(), opts.urls, opts.workers) {
        match res {
            Ok(Resolution::Done(resp)) => println!("{} {}", resp.status.as_u16(), url),
            Ok(Resolution::Blocked(blocked)) => println!("blocked {} ({})", url, blocked.reason),
            Err(err) => println!("failed {} ({:#})", url, err),
        }
    }

    let stats = middleware.stats();
    log::info!(
        "robot checks: {}, solved: {}, blocked: {}, undecodable: {}",
        stats.robot_checks,
        stats.solved,
        stats.blocked,
        stats.decode_errors
    );
    Ok(())
}
