//! Gets an automated crawl past "Robot Check" captcha pages: spots the
//! challenge, reads the distorted letters by matching them against a library
//! of reference glyphs, and resubmits the form, a bounded number of times.

pub mod crawl;
pub mod robot;
