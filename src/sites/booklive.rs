//! BookLive plugin: a BinB-reader storefront with a token-guarded login form.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, bail, Context};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::cookie::{CookieStore, Jar};
use tracing::debug;

use super::binb_api::BinbApi;
use super::{encode_page, output_ext, page_file_name};
use crate::base_system::fs_name::title_dir;
use crate::plugin::options::{OptionSet, PluginOption};
use crate::plugin::{http_client, PageStream, Plugin};

const API_URL: &str = "https://booklive.jp/bib-api/";
const LOGIN_SCREEN_URL: &str = "https://booklive.jp/login";
const LOGIN_URL: &str = "https://booklive.jp/login/index";
const SITE_URL: &str = "https://booklive.jp/";

/// Session cookie that proves the login stuck.
const SESSION_COOKIE: &str = "BL_LI";

fn re_book() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| {
        Regex::new(r"^https?://booklive\.jp/product/index/title_id/([0-9]+?)/vol_no/([0-9]+?)$")
            .unwrap()
    })
}

fn re_reader() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"^https?://booklive\.jp/bviewer/\?cid=([_0-9]+)").unwrap())
}

fn re_login_token() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r#"input type="hidden" name="token" value="(.+?)">"#).unwrap())
}

pub struct BookLive {
    options: OptionSet,
}

impl BookLive {
    pub fn new() -> Self {
        Self {
            options: OptionSet::new(vec![
                PluginOption::string("Username", "").required(),
                PluginOption::string("Password", "").required(),
                PluginOption::boolean("Lossless", false).comment(
                    "If set to true, save as PNG. Original images are in JPEG, so you can't \
                     escape some artifacts even with this on.",
                ),
                PluginOption::int("JPEGQuality", 95).comment(
                    "Does nothing if Lossless is on. >95 not advised, as it increases file \
                     size a ton with little improvement.",
                ),
            ]),
        }
    }
}

impl Default for BookLive {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for BookLive {
    fn name(&self) -> &'static str {
        "BookLive"
    }

    fn can_handle(&self, url: &str) -> bool {
        re_book().is_match(url) || re_reader().is_match(url)
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn open(&self, url: &str) -> anyhow::Result<PageStream> {
        let (cid, volume) = cid_and_volume(url)?;
        let lossless = self.options.bool_value("Lossless").unwrap_or(false);
        let quality = self.options.int_value("JPEGQuality").unwrap_or(95).clamp(1, 100) as u8;
        let ext = output_ext(lossless);

        let jar = Arc::new(Jar::default());
        let client = http_client(Some(Arc::clone(&jar)))?;
        login(
            &client,
            &jar,
            &self.options.str_value("Username").unwrap_or_default(),
            &self.options.str_value("Password").unwrap_or_default(),
        )?;

        let mut api = BinbApi::new(API_URL, &cid, client);
        api.get_content_info().context("getting content info")?;
        api.get_content().context("getting content listing")?;
        let total = api.page_count();
        let dir = title_dir(&format!("{} 第{:02}巻", api.title(), volume));
        let api = Arc::new(api);

        let mut next_page = 0usize;
        let generator = Box::new(move || {
            if next_page >= total {
                return None;
            }
            let page = next_page;
            next_page += 1;

            let api = Arc::clone(&api);
            let dir = dir.clone();
            Some(Box::new(
                move |_worker: usize, sink: &crate::download::sink::ArtifactSink| {
                    let mut resp = api.get_image(page)?;
                    let mut body = Vec::new();
                    sink.copy(&mut body, &mut resp)?;

                    let img = api.descramble_page(page, &body)?;
                    let path = PathBuf::from(&dir).join(page_file_name(page, 0, ext));
                    let writer = sink.stream_writer(&path, false)?;
                    encode_page(writer, &img, lossless, quality)
                },
            ) as crate::plugin::Downloader)
        });

        Ok(PageStream::new(generator, total))
    }

    fn finalise(&self, error: Option<&anyhow::Error>) {
        if let Some(err) = error {
            debug!("run ended with error: {err:#}");
        }
    }
}

/// Scrape the hidden login token, post the form, and verify the session
/// cookie landed in the jar.
fn login(client: &Client, jar: &Arc<Jar>, username: &str, password: &str) -> anyhow::Result<()> {
    let resp = client
        .get(LOGIN_SCREEN_URL)
        .header(reqwest::header::USER_AGENT, crate::plugin::FIREFOX_USER_AGENT)
        .send()
        .context("error while getting login token")?;
    if !resp.status().is_success() {
        bail!("login screen returned status code: {}", resp.status().as_u16());
    }
    let body = resp.text()?;
    let token = re_login_token()
        .captures(&body)
        .map(|c| c[1].to_string())
        .ok_or_else(|| anyhow!("found no login token"))?;

    debug!(token = %token, username = %username, "logging in...");
    let resp = client
        .post(LOGIN_URL)
        .header(reqwest::header::USER_AGENT, crate::plugin::FIREFOX_USER_AGENT)
        .form(&[
            ("mail_addr", username),
            ("pswd", password),
            ("token", token.as_str()),
        ])
        .send()
        .context("failed to login")?;
    if !resp.status().is_success() {
        bail!(
            "login returned status code: {}. Incorrect credentials?",
            resp.status().as_u16()
        );
    }

    let site = reqwest::Url::parse(SITE_URL)?;
    let logged_in = jar
        .cookies(&site)
        .map(|header| {
            header
                .to_str()
                .unwrap_or("")
                .split(';')
                .any(|c| c.trim_start().starts_with(SESSION_COOKIE))
        })
        .unwrap_or(false);
    if !logged_in {
        bail!("failed to login, wrong credentials?");
    }
    debug!("logged in");
    Ok(())
}

/// Both URL forms carry the title and volume; the reader form packs them into
/// the cid directly.
fn cid_and_volume(url: &str) -> anyhow::Result<(String, u32)> {
    if let Some(m) = re_book().captures(url) {
        let cid = format!("{}_{}", &m[1], &m[2]);
        let volume: u32 = m[2].parse()?;
        return Ok((cid, volume));
    }
    if let Some(m) = re_reader().captures(url) {
        let cid = m[1].to_string();
        let volume = cid
            .split('_')
            .nth(1)
            .ok_or_else(|| anyhow!("cid format not <title_id>_<volume>: {cid}"))?
            .parse()?;
        return Ok((cid, volume));
    }
    bail!("URL could not be parsed: {url}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_both_url_forms() {
        let plugin = BookLive::new();
        assert!(plugin.can_handle("https://booklive.jp/product/index/title_id/206197/vol_no/001"));
        assert!(plugin.can_handle("https://booklive.jp/bviewer/?cid=206197_001"));
        assert!(!plugin.can_handle("https://example.com/"));
    }

    #[test]
    fn cid_extraction() {
        let (cid, volume) =
            cid_and_volume("https://booklive.jp/product/index/title_id/206197/vol_no/001").unwrap();
        assert_eq!(cid, "206197_001");
        assert_eq!(volume, 1);

        let (cid, volume) = cid_and_volume("https://booklive.jp/bviewer/?cid=206197_003").unwrap();
        assert_eq!(cid, "206197_003");
        assert_eq!(volume, 3);

        assert!(cid_and_volume("https://booklive.jp/bviewer/?cid=206197").is_err());
    }

    #[test]
    fn login_token_scrape() {
        let html = r#"<form><input type="hidden" name="token" value="abc123"></form>"#;
        let token = re_login_token().captures(html).map(|c| c[1].to_string());
        assert_eq!(token.as_deref(), Some("abc123"));
    }
}
