//! Media references of scheduled posts
//!
//! A post stores its media as references: provider ids uploaded earlier, or
//! public URLs. Platforms that pull media themselves receive URLs as they
//! are. For every other platform each URL is downloaded and pushed through
//! the adapter's `upload_media` right before publishing.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;

use crate::api_manager::{ApiManager, ExecuteOptions};
use crate::error::Result;
use crate::platforms::http::{self, build_client, transport_error};
use crate::platforms::{is_url, media_type_from_url, PlatformAdapter};
use crate::types::{MediaMetadata, MediaType, Platform};

/// Downloaded media, ready for upload
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Downloads media URLs on behalf of platforms that only take uploads
#[derive(Clone)]
pub struct MediaFetcher {
    client: Client,
}

impl MediaFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }

    /// Download `url`; errors name `platform` and the `fetch_media` operation
    pub async fn fetch(&self, platform: Platform, url: &str) -> Result<FetchedMedia> {
        let response = http::send(platform, "fetch_media", self.client.get(url)).await?;

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase())
            .filter(|m| MediaType::from_mime(m).is_some())
            .unwrap_or_else(|| fallback_mime(url).to_string());

        let data = response
            .bytes()
            .await
            .map_err(|e| transport_error(platform, "fetch_media", e))?;

        debug!(platform = %platform, url, bytes = data.len(), mime_type = %mime_type, "Media downloaded");
        Ok(FetchedMedia {
            data: data.to_vec(),
            mime_type,
        })
    }
}

/// Servers that send no usable content type get one guessed from the path
fn fallback_mime(url: &str) -> &'static str {
    match media_type_from_url(url) {
        MediaType::Video => "video/mp4",
        MediaType::Image => "image/jpeg",
    }
}

/// Media ids `adapter` can publish for the `references` of one post
///
/// Downloads are retried like any other call but never charge the
/// platform's quota; uploads do.
pub async fn resolve_media(
    fetcher: &MediaFetcher,
    api: &ApiManager,
    adapter: &dyn PlatformAdapter,
    references: &[String],
    content: &str,
    access_token: &str,
    execute: &ExecuteOptions,
) -> Result<Vec<String>> {
    let platform = adapter.platform();
    if platform.pulls_media_from_url() {
        return Ok(references.to_vec());
    }

    let title = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string);

    let mut media_ids = Vec::with_capacity(references.len());
    for reference in references {
        if !is_url(reference) {
            media_ids.push(reference.clone());
            continue;
        }

        let mut download = execute
            .clone()
            .with_context("mediaUrl", reference.as_str());
        download.skip_rate_limit = true;
        let media = api
            .execute(platform, download, || fetcher.fetch(platform, reference))
            .await?;

        let metadata = MediaMetadata {
            source_url: Some(reference.clone()),
            title: title.clone(),
            alt_text: None,
        };
        let upload = execute
            .clone()
            .with_context("mediaUrl", reference.as_str());
        let uploaded = api
            .execute(platform, upload, || {
                adapter.upload_media(&media.data, &media.mime_type, access_token, Some(&metadata))
            })
            .await?;

        debug!(platform = %platform, media_id = %uploaded.media_id, "Media uploaded");
        media_ids.push(uploaded.media_id);
    }

    Ok(media_ids)
}
