use http::{Method, StatusCode};
use std::collections::BTreeMap;

/// An outbound fetch. The challenge state rides along in `challenge` so that
/// concurrent, unrelated challenges never share anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub form: Vec<(String, String)>,
    pub referer: Option<String>,
    pub challenge: Option<Box<Challenge>>,
}

impl Request {
    pub fn get(url: &str) -> Self {
        Self {
            method: Method::GET,
            url: url.to_owned(),
            form: Vec::new(),
            referer: None,
            challenge: None,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        self.challenge.as_ref().map(|c| c.stage)
    }

    /// Number of challenge pages seen so far for the original request, 0 when
    /// no challenge is in progress.
    pub fn retries(&self) -> u32 {
        self.challenge.as_ref().map_or(0, |c| c.ctx.retries)
    }

    /// The request that first ran into the challenge, or `self` when none is
    /// in progress.
    pub fn original(&self) -> &Request {
        match &self.challenge {
            Some(c) => &c.ctx.original,
            None => self,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub url: String,
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(url: &str, status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.to_owned(),
            status,
            body: body.into(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Which response the carrying request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The original request, replayed after an undecodable captcha image.
    Replay,
    AwaitingImage,
    AwaitingSubmission,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub stage: Stage,
    pub ctx: ChallengeCtx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeCtx {
    /// Stripped of any challenge state of its own.
    pub original: Request,
    pub submit_url: String,
    pub submit_method: Method,
    pub fields: BTreeMap<String, String>,
    pub referer: String,
    pub retries: u32,
}

impl ChallengeCtx {
    pub(crate) fn into_request(self, stage: Stage, method: Method, url: String) -> Request {
        let form = match stage {
            Stage::AwaitingSubmission => self
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => Vec::new(),
        };
        Request {
            method,
            url,
            form,
            referer: Some(self.referer.clone()),
            challenge: Some(Box::new(Challenge { stage, ctx: self })),
        }
    }
}
