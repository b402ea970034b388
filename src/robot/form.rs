use super::RobotErr;
use http::Method;
use regex::Regex;
use select::document::Document;
use select::predicate::{Attr, Name};
use std::collections::BTreeMap;

/// Case-insensitive match of the challenge phrase against the page title.
pub fn is_challenge(doc: &Document, phrase: &Regex) -> bool {
    doc.find(Name("title"))
        .next()
        .map_or(false, |title| phrase.is_match(&title.text()))
}

pub fn challenge_regex(phrase: &str) -> Result<Regex, RobotErr> {
    Regex::new(&format!("(?i){}", regex::escape(phrase)))
        .map_err(|e| RobotErr::ConfigErr(e.to_string()))
}

/// What the challenge page asks to be sent back. Addresses are as found in
/// the page, possibly relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeForm {
    pub action: String,
    pub method: Method,
    pub fields: BTreeMap<String, String>,
    pub image_src: String,
}

impl ChallengeForm {
    pub fn extract(doc: &Document) -> Result<Self, RobotErr> {
        let form = doc
            .find(Name("form"))
            .next()
            .ok_or_else(|| RobotErr::FormErr("no form on challenge page".to_owned()))?;
        let action = form
            .attr("action")
            .ok_or_else(|| RobotErr::FormErr("challenge form has no action".to_owned()))?
            .to_owned();
        let method = form
            .attr("method")
            .map(|m| m.to_ascii_uppercase())
            .map_or(Ok(Method::GET), |m| Method::from_bytes(m.as_bytes()))
            .map_err(|e| RobotErr::FormErr(format!("bad form method: {}", e)))?;
        let image_src = form
            .find(Name("img"))
            .filter_map(|img| img.attr("src"))
            .next()
            .ok_or_else(|| RobotErr::FormErr("challenge form has no image".to_owned()))?
            .to_owned();
        let fields = form
            .find(Name("input"))
            .filter_map(|input| {
                let name = input.attr("name")?;
                let kind = input.attr("type").unwrap_or("text").to_ascii_lowercase();
                let value = match kind.as_str() {
                    "submit" | "image" | "button" | "reset" => return None,
                    "checkbox" | "radio" => {
                        input.attr("checked")?;
                        input.attr("value").unwrap_or("on")
                    }
                    _ => input.attr("value").unwrap_or(""),
                };
                Some((name.to_owned(), value.to_owned()))
            })
            .collect();
        Ok(Self {
            action,
            method,
            fields,
            image_src,
        })
    }

    /// The form's submission target and image address, resolved against the
    /// challenge page's own URL.
    pub fn resolve(&self, page_url: &str) -> Result<(String, String), RobotErr> {
        let base = reqwest::Url::parse(page_url)
            .map_err(|e| RobotErr::FormErr(format!("{}: {}", page_url, e)))?;
        let join = |addr: &str| {
            base.join(addr)
                .map(String::from)
                .map_err(|e| RobotErr::FormErr(format!("{}: {}", addr, e)))
        };
        Ok((join(&self.action)?, join(&self.image_src)?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CHALLENGE_PAGE: &str = r#"<html>
<head><title>Robot Check</title></head>
<body>
  <p>Enter the characters you see below</p>
  <form method="get" action="/errors/validateCaptcha" name="">
    <input type="hidden" name="amzn" value="k7WxQ2"/>
    <input type="hidden" name="amzn-r" value="&#047;dp&#047;1"/>
    <div><img src="https://images.example.com/captcha/abc.jpg"></div>
    <input autocomplete="off" type="text" id="captchacharacters" name="field-keywords">
    <button type="submit">Continue shopping</button>
  </form>
</body></html>"#;

    #[test]
    fn detects_title_case_insensitively() {
        let rgx = challenge_regex("Robot Check").unwrap();
        assert!(is_challenge(&Document::from(CHALLENGE_PAGE), &rgx));
        let shouting = "<html><head><title>ROBOT CHECK</title></head></html>";
        assert!(is_challenge(&Document::from(shouting), &rgx));
        let normal = "<html><head><title>Widgets</title></head><body>robot check</body></html>";
        assert!(!is_challenge(&Document::from(normal), &rgx));
    }

    #[test]
    fn extracts_form() {
        let form = ChallengeForm::extract(&Document::from(CHALLENGE_PAGE)).unwrap();
        assert_eq!(form.action, "/errors/validateCaptcha");
        assert_eq!(form.method, Method::GET);
        assert_eq!(form.image_src, "https://images.example.com/captcha/abc.jpg");
        assert_eq!(form.fields.len(), 3);
        assert_eq!(form.fields["amzn"], "k7WxQ2");
        assert_eq!(form.fields["amzn-r"], "/dp/1");
        assert_eq!(form.fields["field-keywords"], "");
    }

    #[test]
    fn skips_controls_a_browser_would_not_send() {
        let page = r#"<html><body><form action="/errors/validateCaptcha" method="post">
  <input type="hidden" name="amzn" value="k7WxQ2">
  <input type="checkbox" name="remember" value="1">
  <input type="checkbox" name="terms" checked>
  <input type="radio" name="size" value="s">
  <input type="radio" name="size-l" value="l" checked>
  <input type="submit" name="go" value="Continue">
  <input type="IMAGE" name="pic" src="/b.png">
  <input type="button" name="help" value="?">
  <img src="/captcha.jpg">
  <input type="text" name="field-keywords">
</form></body></html>"#;
        let form = ChallengeForm::extract(&Document::from(page)).unwrap();
        assert_eq!(form.method, Method::POST);
        let names: Vec<_> = form.fields.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["amzn", "field-keywords", "size-l", "terms"]);
        assert_eq!(form.fields["terms"], "on");
        assert_eq!(form.fields["size-l"], "l");
    }

    #[test]
    fn resolves_relative_addresses() {
        let form = ChallengeForm::extract(&Document::from(CHALLENGE_PAGE)).unwrap();
        let (submit, img) = form.resolve("https://shop.example.com/dp/1?ref=x").unwrap();
        assert_eq!(submit, "https://shop.example.com/errors/validateCaptcha");
        assert_eq!(img, "https://images.example.com/captcha/abc.jpg");
    }

    #[test]
    fn missing_pieces_are_form_errors() {
        let no_img = r#"<html><form action="/x"><input name="a" value="b"></form></html>"#;
        assert!(matches!(
            ChallengeForm::extract(&Document::from(no_img)),
            Err(RobotErr::FormErr(_))
        ));
        let no_form = "<html><title>Robot Check</title></html>";
        assert!(ChallengeForm::extract(&Document::from(no_form)).is_err());
    }
}
