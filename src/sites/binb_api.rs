//! Client for the API served by the BinB ("book in browser") HTML5 reader.
//!
//! The bib endpoint hands out content info including the encrypted scramble
//! key tables; the actual page images come either from the sbc endpoint or
//! straight from a CDN, depending on the announced server type.

use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context};
use rand::Rng;
use regex::Regex;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use tracing::debug;

use crate::descramble::binb::BinbDescrambler;
use crate::descramble::cipher;

// ── protocol constants ──────────────────────────────────────────

/// Alphabet the reader draws the `k` nonce from, mixed with a timestamp.
const K_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const K_LENGTH: usize = 32;

/// CDN image sizes, best first. M/S is resolution, H/L quality; L artifacts
/// badly, so S_H is preferred over M_L.
const STATIC_IMAGE_SIZES: [&str; 4] = ["M_H", "S_H", "M_L", "S_L"];

fn re_ttx_image_path() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r#"t-img src="(.+?)""#).unwrap())
}

// ── response shapes ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(alias = "result", alias = "Result")]
    result: i32,
    #[serde(alias = "items", alias = "Items", default)]
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ContentInfo {
    #[serde(alias = "Title", default)]
    pub title: String,
    #[serde(alias = "P", default)]
    pub p: String,
    #[serde(alias = "Ctbl", default)]
    pub ctbl: String,
    #[serde(alias = "Ptbl", default)]
    pub ptbl: String,
    #[serde(alias = "ContentsServer", default)]
    pub contents_server: String,
    #[serde(alias = "ServerType", default = "unset_server_type")]
    pub server_type: i32,
}

fn unset_server_type() -> i32 {
    -1
}

#[derive(Debug, Default, Deserialize)]
struct ContentPayload {
    #[serde(alias = "ttx", alias = "Ttx", default)]
    ttx: String,
    #[serde(alias = "SmlImageCnt", alias = "smlImageCnt", default)]
    sml_image_cnt: usize,
}

/// Whether images come through the sbc API or straight off a CDN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentServerType {
    Sbc,
    Static,
}

// ── the client ──────────────────────────────────────────────────

pub struct BinbApi {
    bib: String,
    cid: String,
    k: String,
    client: Client,
    server_type: Option<ContentServerType>,
    content_server: String,
    content_info: Option<ContentInfo>,
    pages: Vec<String>,
    full_pages: Vec<String>,
    descrambler: Option<Arc<BinbDescrambler>>,
}

impl BinbApi {
    pub fn new(bib: &str, cid: &str, client: Client) -> Self {
        Self {
            bib: bib.trim_end_matches('/').to_string(),
            cid: cid.to_string(),
            k: generate_k(),
            client,
            server_type: None,
            content_server: String::new(),
            content_info: None,
            pages: Vec::new(),
            full_pages: Vec::new(),
            descrambler: None,
        }
    }

    pub fn title(&self) -> &str {
        self.content_info.as_ref().map(|i| i.title.as_str()).unwrap_or("")
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Fetch content info, decrypt the key tables and build the descrambler.
    pub fn get_content_info(&mut self) -> anyhow::Result<()> {
        let url = format!(
            "{}/bibGetCntntInfo.php?cid={}&k={}",
            self.bib,
            urlencode_component(&self.cid),
            urlencode_component(&self.k)
        );
        debug!(url = %url, "calling get_content_info...");

        let resp = self.client.get(&url).send()?;
        if !resp.status().is_success() {
            bail!("HTTP request returned error code: {}", resp.status().as_u16());
        }
        let envelope: ApiEnvelope = resp.json()?;
        if envelope.result != 1 {
            bail!("get_content_info returned result: {}", envelope.result);
        }
        let first = envelope
            .items
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("get_content_info returned an empty items list"))?;
        let info: ContentInfo = serde_json::from_value(first)?;

        let ctbl = cipher::decrypt_key_table(&self.cid, &self.k, &info.ctbl)
            .context("decrypting Ctbl")?;
        let ptbl = cipher::decrypt_key_table(&self.cid, &self.k, &info.ptbl)
            .context("decrypting Ptbl")?;
        self.descrambler = Some(Arc::new(BinbDescrambler::new(&ctbl, &ptbl)?));

        self.content_server = info.contents_server.trim_end_matches('/').to_string();
        self.server_type = Some(match info.server_type {
            0 => ContentServerType::Sbc,
            1 => ContentServerType::Static,
            other => bail!("unknown content server type: {other}"),
        });
        self.content_info = Some(info);
        Ok(())
    }

    /// Fetch the content listing and populate the page name tables.
    pub fn get_content(&mut self) -> anyhow::Result<()> {
        if self.server_type.is_none() {
            debug!("get_content called with an unset server type, getting content info...");
            self.get_content_info()
                .context("failed to ensure content info")?;
        }

        let payload = match self.server_type {
            Some(ContentServerType::Sbc) => {
                let info = self.require_info()?;
                if info.p.is_empty() {
                    bail!("tried to use the sbc API without a p value set");
                }
                let url = format!(
                    "{}/sbcGetCntnt.php?cid={}&p={}",
                    self.content_server,
                    urlencode_component(&self.cid),
                    urlencode_component(&info.p)
                );
                debug!(url = %url, "calling get_content...");
                let resp = self.client.get(&url).send()?;
                if !resp.status().is_success() {
                    bail!("HTTP request returned error code: {}", resp.status().as_u16());
                }
                resp.json::<ContentPayload>()?
            }
            Some(ContentServerType::Static) => {
                let url = format!("{}/content.js", self.content_server);
                debug!(url = %url, "getting content from CDN...");
                let resp = self.client.get(&url).send()?;
                if !resp.status().is_success() {
                    bail!("HTTP request returned error code: {}", resp.status().as_u16());
                }
                // Served as JS meant for eval(): DataGet_Content(<json>)
                let body = resp.text()?;
                let json = body
                    .strip_prefix("DataGet_Content(")
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(|| anyhow!("content.js shorter than expected: {}", body.len()))?;
                serde_json::from_str::<ContentPayload>(json)?
            }
            None => bail!("content server type still unset"),
        };

        let paths: Vec<String> = re_ttx_image_path()
            .captures_iter(&payload.ttx)
            .map(|c| c[1].to_string())
            .collect();
        if paths.is_empty() {
            bail!("no image listing found");
        }
        if paths.len() < payload.sml_image_cnt {
            bail!(
                "image listing shorter than announced: {} < {}",
                paths.len(),
                payload.sml_image_cnt
            );
        }

        self.full_pages = paths[..payload.sml_image_cnt].to_vec();
        self.pages = self
            .full_pages
            .iter()
            .map(|full| match full.rfind('/') {
                Some(idx) => full[idx + 1..].to_string(),
                None => full.clone(),
            })
            .collect();
        Ok(())
    }

    /// Fetch one page image; the caller streams the body through its sink.
    pub fn get_image(&self, page: usize) -> anyhow::Result<Response> {
        let full = self
            .full_pages
            .get(page)
            .ok_or_else(|| anyhow!("page {page} out of range"))?;

        match self.server_type {
            Some(ContentServerType::Sbc) => {
                let info = self.require_info()?;
                // h=9999&q=0 make the API return the largest image it has
                let url = format!(
                    "{}/sbcGetImg.php?cid={}&p={}&src={}&h=9999&q=0",
                    self.content_server,
                    urlencode_component(&self.cid),
                    urlencode_component(&info.p),
                    urlencode_component(full)
                );
                debug!(url = %url, "calling get_image...");
                let resp = self.client.get(&url).send()?;
                if !resp.status().is_success() {
                    bail!("HTTP request returned error code: {}", resp.status().as_u16());
                }
                Ok(resp)
            }
            Some(ContentServerType::Static) => {
                for size in STATIC_IMAGE_SIZES {
                    let url = format!("{}/{}/{}.jpg", self.content_server, full, size);
                    debug!(url = %url, "getting image from CDN...");
                    let resp = self.client.get(&url).send()?;
                    if resp.status() == reqwest::StatusCode::NOT_FOUND {
                        debug!(size, "image not found");
                        continue;
                    }
                    if !resp.status().is_success() {
                        // Some CDNs answer oddly for sizes a directory lacks,
                        // so keep trying the smaller ones.
                        debug!("HTTP request returned error code: {}", resp.status().as_u16());
                        continue;
                    }
                    return Ok(resp);
                }
                bail!("unable to get image from the CDN")
            }
            None => bail!("content server type still unset"),
        }
    }

    /// Descramble a fetched page by its index.
    pub fn descramble_page(&self, page: usize, data: &[u8]) -> anyhow::Result<image::RgbaImage> {
        let name = self
            .pages
            .get(page)
            .ok_or_else(|| anyhow!("page {page} out of range"))?;
        let descrambler = self
            .descrambler
            .as_ref()
            .ok_or_else(|| anyhow!("descrambler not initialised"))?;
        Ok(descrambler.descramble(name, data)?)
    }

    fn require_info(&self) -> anyhow::Result<&ContentInfo> {
        self.content_info
            .as_ref()
            .ok_or_else(|| anyhow!("content info not fetched"))
    }
}

/// The reader builds `k` from a timestamp-seeded character pool; doing the
/// same keeps our requests indistinguishable from its own.
fn generate_k() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros();
    let source = format!("{micros}{K_ALPHABET}");
    let bytes = source.as_bytes();
    let mut rng = rand::thread_rng();
    (0..K_LENGTH)
        .map(|_| bytes[rng.gen_range(0..bytes.len())] as char)
        .collect()
}

pub(crate) fn urlencode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k_is_32_chars_from_the_pool() {
        let k = generate_k();
        assert_eq!(k.len(), K_LENGTH);
        assert!(k
            .chars()
            .all(|c| c.is_ascii_digit() || K_ALPHABET.contains(c)));
    }

    #[test]
    fn ttx_listing_is_extracted_in_order() {
        let ttx = r#"<t-case><t-img src="pages/0001"><t-img src="pages/0002">"#;
        let paths: Vec<String> = re_ttx_image_path()
            .captures_iter(ttx)
            .map(|c| c[1].to_string())
            .collect();
        assert_eq!(paths, vec!["pages/0001", "pages/0002"]);
    }

    #[test]
    fn content_payload_accepts_reader_field_casing() {
        let payload: ContentPayload =
            serde_json::from_str(r#"{"ttx": "x", "SmlImageCnt": 3}"#).unwrap();
        assert_eq!(payload.sml_image_cnt, 3);
        let envelope: ApiEnvelope =
            serde_json::from_str(r#"{"result": 1, "items": [{}]}"#).unwrap();
        assert_eq!(envelope.result, 1);
        assert_eq!(envelope.items.len(), 1);
    }

    #[test]
    fn urlencode_escapes_reserved_bytes() {
        assert_eq!(urlencode_component("a b/c"), "a%20b%2Fc");
        assert_eq!(urlencode_component("safe-_.~"), "safe-_.~");
    }
}
