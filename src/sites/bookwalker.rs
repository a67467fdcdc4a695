//! BookWalker plugin: browser-viewer API with CloudFront-signed content.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context};
use rand::Rng;
use regex::Regex;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use tracing::{debug, info};

use super::{encode_page, output_ext, page_file_name};
use crate::base_system::fs_name::title_dir;
use crate::descramble::bookwalker::BookwalkerDescrambler;
use crate::plugin::options::{OptionSet, PluginOption};
use crate::plugin::{http_client, PageStream, Plugin, IE11_USER_AGENT};

const API_URL: &str = "https://viewer.bookwalker.jp/browserWebApi";
const LOGIN_URL: &str = "https://member.bookwalker.jp/app/j_spring_security_check";
const LOGOUT_URL: &str = "https://member.bookwalker.jp/app/03/logout";

const BROWSER_ID_SUFFIX: &str = "NFBR";

fn re_book() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| {
        Regex::new(
            r"^https?://bookwalker\.jp/de([a-zA-Z0-9]+?-[a-zA-Z0-9]+?-[a-zA-Z0-9]+?-[a-zA-Z0-9]+?-[a-zA-Z0-9]+?)(?:/.*)?$",
        )
        .unwrap()
    })
}

fn re_profile() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"^https?://member\.bookwalker\.jp/app/03/my/profile").unwrap())
}

// ── session and content structures ──────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BookSession {
    #[serde(default)]
    status: String,
    #[serde(default)]
    url: String,
    #[serde(rename = "cti", default)]
    title: String,
    #[serde(default)]
    auth_info: AuthInfo,
}

#[derive(Debug, Default, Deserialize)]
struct AuthInfo {
    #[serde(default)]
    hti: String,
    #[serde(rename = "cfg", default)]
    config: i64,
    #[serde(rename = "Policy", default)]
    policy: String,
    #[serde(rename = "Signature", default)]
    signature: String,
    #[serde(rename = "Key-Pair-Id", default)]
    key_pair_id: String,
}

#[derive(Debug, Deserialize)]
struct BookConfig {
    #[serde(default)]
    contents: Vec<ConfigEntry>,
}

#[derive(Debug, Deserialize)]
struct ConfigEntry {
    #[serde(default)]
    file: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BookContent {
    #[serde(skip)]
    file_path: String,
    #[serde(rename = "FileLinkInfo", default)]
    file_link_info: FileLinkInfo,
}

#[derive(Debug, Default, Deserialize)]
struct FileLinkInfo {
    #[serde(rename = "PageLinkInfoList", default)]
    page_link_info_list: Vec<PageLinkInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct PageLinkInfo {
    #[serde(rename = "Page", default)]
    page: PageInfo,
}

#[derive(Debug, Default, Deserialize)]
struct PageInfo {
    #[serde(rename = "No", default)]
    no: i64,
    #[serde(rename = "DummyWidth", default)]
    dummy_width: u32,
    #[serde(rename = "DummyHeight", default)]
    dummy_height: u32,
}

// ── the plugin ──────────────────────────────────────────────────

pub struct BookWalker {
    options: OptionSet,
}

impl BookWalker {
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

impl Default for BookWalker {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only per-URL session shared by all page thunks.
struct BookWalkerRun {
    client: Client,
    session: BookSession,
    content: Vec<BookContent>,
    descrambler: BookwalkerDescrambler,
}

impl Plugin for BookWalker {
    fn name(&self) -> &'static str {
        "BookWalker"
    }

    fn can_handle(&self, url: &str) -> bool {
        re_book().is_match(url)
    }

    fn options(&self) -> &OptionSet {
        &self.options
    }

    fn open(&self, url: &str) -> anyhow::Result<PageStream> {
        let cid = re_book()
            .captures(url)
            .map(|m| m[1].to_string())
            .ok_or_else(|| anyhow!("URL could not be parsed: {url}"))?;
        let lossless = self.options.bool_value("Lossless").unwrap_or(false);
        let quality = self.options.int_value("JPEGQuality").unwrap_or(95).clamp(1, 100) as u8;
        let ext = output_ext(lossless);

        let client = http_client(None)?;
        info!("logging in...");
        login(
            &client,
            &self.options.str_value("Username").unwrap_or_default(),
            &self.options.str_value("Password").unwrap_or_default(),
        )?;

        let session = book_session(&client, &cid)?;
        let dir = title_dir(&session.title);
        let content = content_info(&client, &session)?;
        let total = content.len();

        let run = Arc::new(BookWalkerRun {
            client,
            session,
            content,
            descrambler: BookwalkerDescrambler::new(),
        });

        let mut next_page = 0usize;
        let generator = Box::new(move || {
            if next_page >= total {
                return None;
            }
            let page = next_page;
            next_page += 1;

            let run = Arc::clone(&run);
            let dir = dir.clone();
            Some(Box::new(
                move |_worker: usize, sink: &crate::download::sink::ArtifactSink| {
                    let content = &run.content[page];
                    // A content file lists one or more constituent images;
                    // nearly always a single subpage.
                    for link in &content.file_link_info.page_link_info_list {
                        let subpage = link.page.no;
                        let mut resp = get_image(&run.client, &run.session, content, subpage)?;
                        let mut body = Vec::new();
                        sink.copy(&mut body, &mut resp)?;

                        let scramble_path = format!("{}/{}", content.file_path, subpage);
                        let img = run.descrambler.descramble(
                            &scramble_path,
                            &body,
                            link.page.dummy_width,
                            link.page.dummy_height,
                        )?;

                        let name = page_file_name(page, subpage.max(0) as usize, ext);
                        let path = PathBuf::from(&dir).join(name);
                        let writer = sink.stream_writer(&path, false)?;
                        encode_page(writer, &img, lossless, quality)?;
                    }
                    Ok(())
                },
            ) as crate::plugin::Downloader)
        });

        Ok(PageStream::new(generator, total))
    }

    fn finalise(&self, _error: Option<&anyhow::Error>) {
        info!("logging out...");
        if let Ok(client) = http_client(None) {
            if let Err(err) = logout(&client) {
                debug!("logout failed: {err:#}");
            }
        }
    }
}

fn login(client: &Client, username: &str, password: &str) -> anyhow::Result<()> {
    let resp = client
        .post(LOGIN_URL)
        .header(reqwest::header::USER_AGENT, IE11_USER_AGENT)
        .form(&[
            ("j_username", username),
            ("j_password", password),
            ("j_platform_code", "03"),
        ])
        .send()
        .context("failed to login")?;
    if !resp.status().is_success() {
        bail!(
            "login returned status code: {}. Did the login API change?",
            resp.status().as_u16()
        );
    }
    // A successful login redirects to the profile page.
    if !re_profile().is_match(resp.url().as_str()) {
        bail!("failed to login, wrong credentials?");
    }
    Ok(())
}

fn logout(client: &Client) -> anyhow::Result<()> {
    let resp = client
        .get(LOGOUT_URL)
        .header(reqwest::header::USER_AGENT, IE11_USER_AGENT)
        .send()?;
    if !resp.status().is_success() {
        bail!("logout returned status code: {}", resp.status().as_u16());
    }
    Ok(())
}

/// Authenticate for the cid, then trade the browser id for a book session.
fn book_session(client: &Client, cid: &str) -> anyhow::Result<BookSession> {
    let bid = browser_id(BROWSER_ID_SUFFIX);
    let inner = format!("cid={cid}");
    let auth_url = format!(
        "{API_URL}/auth?params={}&ref=",
        super::binb_api::urlencode_component(&inner)
    );
    debug!(url = %auth_url, "authenticating...");
    let resp = client
        .get(&auth_url)
        .header(reqwest::header::USER_AGENT, IE11_USER_AGENT)
        .send()
        .context("failed to authenticate for a book session")?;
    if !resp.status().is_success() {
        bail!("auth returned status code: {}. Did the API change?", resp.status().as_u16());
    }

    let session_url = format!("{API_URL}/c?cid={cid}&BID={bid}");
    debug!(url = %session_url, "getting book session...");
    let resp = client
        .get(&session_url)
        .header(reqwest::header::USER_AGENT, IE11_USER_AGENT)
        .send()
        .context("failed to get a book session")?;
    if !resp.status().is_success() {
        bail!("session returned status code: {}. Did the API change?", resp.status().as_u16());
    }

    let session: BookSession = resp.json()?;
    if session.status != "200" {
        bail!("book session API returned status code: {}", session.status);
    }
    Ok(session)
}

/// Fetch `configuration_pack.json` and unpack each content entry.
fn content_info(client: &Client, session: &BookSession) -> anyhow::Result<Vec<BookContent>> {
    let url = format!(
        "{}configuration_pack.json?{}",
        session.url,
        signed_query(session)
    );
    debug!(url = %url, "getting content info...");
    let resp = client
        .get(&url)
        .header(reqwest::header::USER_AGENT, IE11_USER_AGENT)
        .send()?;
    if !resp.status().is_success() {
        bail!("content info returned status code: {}", resp.status().as_u16());
    }

    let mut pack: serde_json::Map<String, serde_json::Value> =
        resp.json().context("failed to get book content info")?;
    let config_value = pack
        .remove("configuration")
        .ok_or_else(|| anyhow!("content info had no configuration key"))?;
    let config: BookConfig =
        serde_json::from_value(config_value).context("failed to process content info")?;

    let mut pages = Vec::with_capacity(config.contents.len());
    for entry in config.contents {
        let value = pack
            .remove(&entry.file)
            .ok_or_else(|| anyhow!("content info missing entry for {}", entry.file))?;
        let mut content: BookContent =
            serde_json::from_value(value).context("failed to process content info")?;
        content.file_path = entry.file;
        pages.push(content);
    }
    Ok(pages)
}

fn get_image(
    client: &Client,
    session: &BookSession,
    content: &BookContent,
    subpage: i64,
) -> anyhow::Result<Response> {
    let url = format!(
        "{}{}/{}.jpeg?{}",
        session.url,
        content.file_path,
        subpage,
        signed_query(session)
    );
    let resp = client
        .get(&url)
        .header(reqwest::header::USER_AGENT, IE11_USER_AGENT)
        .send()?;
    if !resp.status().is_success() {
        bail!("failed to get image: status code {}", resp.status().as_u16());
    }
    Ok(resp)
}

/// The CloudFront-style signature triple every content request carries.
fn signed_query(session: &BookSession) -> String {
    let auth = &session.auth_info;
    format!(
        "hti={}&cfg={}&Policy={}&Signature={}&Key-Pair-Id={}",
        super::binb_api::urlencode_component(&auth.hti),
        auth.config,
        super::binb_api::urlencode_component(&auth.policy),
        super::binb_api::urlencode_component(&auth.signature),
        super::binb_api::urlencode_component(&auth.key_pair_id),
    )
}

/// Millisecond timestamp + 8 random digits + a fixed suffix, like the viewer
/// generates.
fn browser_id(suffix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let r: u32 = rand::thread_rng().gen_range(0..100_000_000);
    format!("{millis}{r:08}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_store_urls() {
        let plugin = BookWalker::new();
        assert!(plugin.can_handle("https://bookwalker.jp/de0123abcd-aaaa-bbbb-cccc-0123456789ab/"));
        assert!(plugin.can_handle("https://bookwalker.jp/de0123abcd-aaaa-bbbb-cccc-0123456789ab"));
        assert!(!plugin.can_handle("https://bookwalker.jp/top/"));
    }

    #[test]
    fn browser_id_shape() {
        let bid = browser_id(BROWSER_ID_SUFFIX);
        assert!(bid.ends_with(BROWSER_ID_SUFFIX));
        assert!(bid.len() > BROWSER_ID_SUFFIX.len() + 8);
    }

    #[test]
    fn content_pack_unwrapping() {
        let pack = r#"{
            "configuration": {"contents": [{"file": "item/p-001"}]},
            "item/p-001": {
                "FileLinkInfo": {
                    "PageLinkInfoList": [
                        {"Page": {"No": 0, "DummyWidth": 64, "DummyHeight": 0}}
                    ]
                }
            }
        }"#;
        let mut map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(pack).unwrap();
        let config: BookConfig =
            serde_json::from_value(map.remove("configuration").unwrap()).unwrap();
        assert_eq!(config.contents.len(), 1);
        let content: BookContent =
            serde_json::from_value(map.remove("item/p-001").unwrap()).unwrap();
        let link = &content.file_link_info.page_link_info_list[0];
        assert_eq!(link.page.no, 0);
        assert_eq!(link.page.dummy_width, 64);
        assert_eq!(link.page.dummy_height, 0);
    }
}
