use regex::Regex;
use select::document::Document;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::error;

pub mod captcha;
pub mod form;
pub mod glyphs;
pub mod request;

use form::ChallengeForm;
use glyphs::GlyphSet;
pub use request::{Challenge, ChallengeCtx, Request, Response, Stage};

#[derive(Debug)]
pub enum RobotErr {
    DecodeErr(image::ImageError),
    ConfigErr(String),
    RetryBoundErr(u32),
    FormErr(String),
}

impl From<image::ImageError> for RobotErr {
    fn from(value: image::ImageError) -> Self {
        RobotErr::DecodeErr(value)
    }
}

impl Display for RobotErr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RobotErr::DecodeErr(e) => write!(f, "captcha image undecodable: {}", e),
            RobotErr::ConfigErr(s) => write!(f, "glyph library misconfigured: {}", s),
            RobotErr::RetryBoundErr(n) => write!(f, "still challenged after {} attempts", n),
            RobotErr::FormErr(s) => write!(f, "unusable challenge form: {}", s),
        }
    }
}

impl error::Error for RobotErr {}

#[derive(Debug, Clone)]
pub struct Settings {
    pub threshold: u8,
    pub min_width: u32,
    pub max_retry: u32,
    pub answer_field: String,
    pub challenge_phrase: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threshold: captcha::THRESHOLD,
            min_width: captcha::MIN_WIDTH,
            max_retry: 3,
            answer_field: "field-keywords".to_owned(),
            challenge_phrase: "Robot Check".to_owned(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    robot_checks: AtomicUsize,
    solved: AtomicUsize,
    blocked: AtomicUsize,
    decode_errors: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub robot_checks: usize,
    pub solved: usize,
    pub blocked: usize,
    pub decode_errors: usize,
}

impl Stats {
    fn inc(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            robot_checks: self.robot_checks.load(Ordering::Relaxed),
            solved: self.solved.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// An original request given up on.
#[derive(Debug)]
pub struct Blocked {
    pub original: Request,
    pub retries: u32,
    pub reason: RobotErr,
}

/// What the engine should do with a completed response.
#[derive(Debug)]
pub enum Outcome {
    /// Hand the response to whoever asked for it.
    Pass(Response),
    /// Issue this request next; its response comes back here.
    Emit(Request),
    Blocked(Blocked),
}

/// Captcha-solving response hook. Holds only read-only configuration and
/// counters; every bit of per-challenge state travels on the requests.
pub struct RobotMiddleware {
    settings: Settings,
    glyphs: Arc<GlyphSet>,
    phrase: Regex,
    stats: Stats,
}

impl RobotMiddleware {
    pub fn new(settings: Settings, glyphs: Arc<GlyphSet>) -> Result<Self, RobotErr> {
        let phrase = form::challenge_regex(&settings.challenge_phrase)?;
        Ok(Self {
            settings,
            glyphs,
            phrase,
            stats: Stats::default(),
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn solve(&self, image: &[u8]) -> Result<String, RobotErr> {
        captcha::solve(
            image,
            &self.glyphs,
            self.settings.threshold,
            self.settings.min_width,
        )
    }

    pub fn process_response(&self, mut request: Request, response: Response) -> Outcome {
        let challenge = match request.challenge.take().map(|c| *c) {
            Some(Challenge {
                stage: Stage::AwaitingImage,
                ctx,
            }) => return self.answer(ctx, &response),
            other => other,
        };

        let doc = Document::from(response.text().as_str());
        if !form::is_challenge(&doc, &self.phrase) {
            if let Some(Challenge { stage, ctx }) = challenge {
                if stage == Stage::AwaitingSubmission {
                    Stats::inc(&self.stats.solved);
                }
                log::info!(
                    "{} passed after {} robot check(s)",
                    ctx.original.url,
                    ctx.retries
                );
            }
            return Outcome::Pass(response);
        }

        let (original, retries) = match challenge {
            Some(c) => (c.ctx.original, c.ctx.retries + 1),
            None => (request, 1),
        };
        Stats::inc(&self.stats.robot_checks);
        log::warn!("Robot Check #{} for {}", retries, original.url);

        if retries >= self.settings.max_retry {
            return self.block(original, retries, RobotErr::RetryBoundErr(retries));
        }
        let found = ChallengeForm::extract(&doc)
            .and_then(|f| f.resolve(&response.url).map(|urls| (f, urls)));
        let (form, (submit_url, image_url)) = match found {
            Ok(found) => found,
            Err(err) => return self.block(original, retries, err),
        };

        let ctx = ChallengeCtx {
            original,
            submit_url,
            submit_method: form.method,
            fields: form.fields,
            referer: response.url,
            retries,
        };
        Outcome::Emit(ctx.into_request(Stage::AwaitingImage, http::Method::GET, image_url))
    }

    fn answer(&self, mut ctx: ChallengeCtx, image: &Response) -> Outcome {
        match self.solve(&image.body) {
            Ok(guess) => {
                log::info!("Captcha value: {}", guess);
                ctx.fields.insert(self.settings.answer_field.clone(), guess);
                let method = ctx.submit_method.clone();
                let url = ctx.submit_url.clone();
                Outcome::Emit(ctx.into_request(Stage::AwaitingSubmission, method, url))
            }
            Err(err) => {
                Stats::inc(&self.stats.decode_errors);
                log::warn!("{} from {}, replaying {}", err, image.url, ctx.original.url);
                let mut replay = ctx.original.clone();
                replay.challenge = Some(Box::new(Challenge {
                    stage: Stage::Replay,
                    ctx,
                }));
                Outcome::Emit(replay)
            }
        }
    }

    fn block(&self, original: Request, retries: u32, reason: RobotErr) -> Outcome {
        Stats::inc(&self.stats.blocked);
        log::error!("giving up on {}: {}", original.url, reason);
        Outcome::Blocked(Blocked {
            original,
            retries,
            reason,
        })
    }
}
