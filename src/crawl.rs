use crate::robot::{Blocked, Outcome, Request, Response, RobotMiddleware};
use anyhow::{anyhow, Context};
use base64::engine::general_purpose;
use base64::Engine;
use http::{Method, StatusCode};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::blocking::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

lazy_static! {
    static ref DATA_URL_RGX: Regex = Regex::new(r#"^data:([^;,]*)((?:;[^;,]*)*),(.*)$"#).unwrap();
}

pub const DEFAULT_UA: &str = "Mozilla/5.0 (Windows NT 10.0; rv:102.0) Gecko/20100101 Firefox/102.0";

/// Performs single fetches. Redirect handling and cookies are its business.
pub trait Transport: Send + Sync {
    fn fetch(&self, req: &Request) -> anyhow::Result<Response>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, socks_proxy_url: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::blocking::ClientBuilder::new()
            .cookie_store(true)
            .user_agent(user_agent);
        if let Some(proxy_url) = socks_proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl HttpTransport {
    /// GET forms go in the query string, anything else as an url-encoded body.
    fn build(&self, req: &Request) -> reqwest::Result<reqwest::blocking::Request> {
        let mut builder = self.client.request(req.method.clone(), &req.url);
        if !req.form.is_empty() {
            builder = if req.method == Method::GET {
                builder.query(&req.form)
            } else {
                builder.form(&req.form)
            };
        }
        if let Some(referer) = &req.referer {
            builder = builder.header(http::header::REFERER, referer);
        }
        builder.build()
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, req: &Request) -> anyhow::Result<Response> {
        if req.url.starts_with("data:") {
            return decode_data_url(&req.url);
        }
        let resp = self
            .build(req)
            .and_then(|built| self.client.execute(built))
            .with_context(|| format!("{} {}", req.method, req.url))?;
        let url = resp.url().to_string();
        let status = resp.status();
        let body = resp.bytes()?.to_vec();
        Ok(Response { url, status, body })
    }
}

/// Inline `data:` images, as some challenge pages embed the captcha directly.
fn decode_data_url(url: &str) -> anyhow::Result<Response> {
    let caps = DATA_URL_RGX
        .captures(url)
        .ok_or_else(|| anyhow!("malformed data url"))?;
    let payload = caps.get(3).map_or("", |m| m.as_str());
    let is_base64 = caps
        .get(2)
        .map_or(false, |m| m.as_str().split(';').any(|p| p == "base64"));
    let body = if is_base64 {
        general_purpose::STANDARD
            .decode(payload)
            .context("bad base64 in data url")?
    } else {
        payload.as_bytes().to_vec()
    };
    Ok(Response::new(url, StatusCode::OK, body))
}

#[derive(Debug)]
pub enum Resolution {
    Done(Response),
    Blocked(Blocked),
}

/// Follows one original request through however many challenge rounds it
/// takes. Transport failures abort the chain.
pub fn run_request(
    transport: &dyn Transport,
    middleware: &RobotMiddleware,
    original: Request,
) -> anyhow::Result<Resolution> {
    let mut next = original;
    loop {
        let resp = transport.fetch(&next)?;
        match middleware.process_response(next, resp) {
            Outcome::Pass(resp) => return Ok(Resolution::Done(resp)),
            Outcome::Blocked(blocked) => return Ok(Resolution::Blocked(blocked)),
            Outcome::Emit(req) => next = req,
        }
    }
}

/// Fetches every URL on `workers` threads sharing one middleware. Results
/// come back in completion order.
pub fn crawl(
    transport: Arc<dyn Transport>,
    middleware: Arc<RobotMiddleware>,
    urls: Vec<String>,
    workers: usize,
) -> Vec<(String, anyhow::Result<Resolution>)> {
    let (url_tx, url_rx) = crossbeam_channel::unbounded::<String>();
    let (res_tx, res_rx) = crossbeam_channel::unbounded();
    let mut pending: HashMap<String, usize> = HashMap::new();
    for url in &urls {
        *pending.entry(url.clone()).or_default() += 1;
    }

    let handles: Vec<_> = (0..workers.max(1))
        .map(|_| {
            let url_rx = url_rx.clone();
            let res_tx = res_tx.clone();
            let transport = transport.clone();
            let middleware = middleware.clone();
            thread::spawn(move || {
                for url in url_rx.iter() {
                    let res = run_request(transport.as_ref(), &middleware, Request::get(&url));
                    if let Err(err) = &res {
                        log::error!("{}: {:#}", url, err);
                    }
                    if res_tx.send((url, res)).is_err() {
                        return;
                    }
                }
            })
        })
        .collect();
    drop(url_rx);
    drop(res_tx);

    for url in urls {
        // every worker is gone, the rest is reported below
        if url_tx.send(url).is_err() {
            break;
        }
    }
    drop(url_tx);

    let mut results: Vec<_> = res_rx.iter().collect();
    for h in handles {
        if h.join().is_err() {
            log::error!("crawl worker panicked");
        }
    }
    for (url, _) in &results {
        if let Some(n) = pending.get_mut(url) {
            *n -= 1;
        }
    }
    for (url, n) in pending {
        for _ in 0..n {
            let err = anyhow!("crawl worker died before finishing {}", url);
            results.push((url.clone(), Err(err)));
        }
    }
    results
}
