//! Podcast episodes: latest-episode lookup and local download.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{debug, info};

use crate::error::{Error, FeedError, FileSystemError, Result};
use crate::store::sanitize_filename;

/// HTTP timeout for feed and media requests.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest title fragment, in characters, used in a download file name.
const MAX_TITLE_CHARS: usize = 100;

/// The newest episode of a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Episode {
    /// Episode title.
    pub title: String,
    /// Web page link, empty when the feed has none.
    pub link: String,
    /// Publication time.
    pub published: DateTime<Utc>,
    /// Audio file URL.
    pub media_url: String,
}

impl Episode {
    /// Deterministic local file name: `<YYYY-MM-DD>_<title>.mp3`, where the
    /// title keeps only alphanumerics, spaces, `-` and `_`, is capped at 100
    /// characters, and has spaces turned into underscores.
    pub fn file_name(&self) -> String {
        let kept: String = self
            .title
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
            .collect();
        let title: String = kept.trim_end().chars().take(MAX_TITLE_CHARS).collect();
        let date = self.published.format("%Y-%m-%d");
        format!("{date}_{title}.mp3").replace(' ', "_")
    }
}

/// Source of podcast episodes.
#[cfg_attr(test, mockall::automock)]
pub trait EpisodeSource: Send + Sync {
    /// Newest episode of the feed, or `None` when the feed has no entries or
    /// no discoverable audio URL.
    fn latest_episode(&self, feed_url: &str) -> Result<Option<Episode>>;

    /// Download `episode` for `podcast_name`, returning the local path. An
    /// already-downloaded file is returned as is.
    fn download(&self, episode: &Episode, podcast_name: &str) -> Result<PathBuf>;
}

/// Parse feed XML and return its first item as an [`Episode`].
pub fn parse_latest(xml: &[u8], feed_url: &str) -> Result<Option<Episode>> {
    let channel = rss::Channel::read_from(xml).map_err(|e| {
        Error::Feed(FeedError::ParseFailed {
            url: feed_url.to_string(),
            reason: e.to_string(),
        })
    })?;

    let Some(item) = channel.items().first() else {
        debug!("No entries in feed {}", feed_url);
        return Ok(None);
    };

    let title = item.title().unwrap_or("Untitled").to_string();
    let Some(media_url) = media_url(item) else {
        info!("No media URL found for episode: {}", title);
        return Ok(None);
    };

    Ok(Some(Episode {
        title,
        link: item.link().unwrap_or_default().to_string(),
        published: published(item).unwrap_or_else(Utc::now),
        media_url,
    }))
}

/// Enclosure URL, else the first `media:content` with an audio type.
fn media_url(item: &rss::Item) -> Option<String> {
    if let Some(enclosure) = item.enclosure()
        && !enclosure.url().is_empty()
    {
        return Some(enclosure.url().to_string());
    }

    item.extensions()
        .get("media")
        .and_then(|media| media.get("content"))
        .into_iter()
        .flatten()
        .find(|ext| {
            ext.attrs()
                .get("type")
                .is_some_and(|t| t.starts_with("audio/"))
        })
        .and_then(|ext| ext.attrs().get("url").cloned())
        .filter(|url| !url.is_empty())
}

fn published(item: &rss::Item) -> Option<DateTime<Utc>> {
    let from_pub_date = item.pub_date().and_then(|date| {
        DateTime::parse_from_rfc2822(date)
            .ok()
            .or_else(|| parse_relaxed_date(date))
    });

    from_pub_date
        .or_else(|| {
            item.dublin_core_ext()
                .and_then(|dc| dc.dates().first())
                .and_then(|date| {
                    DateTime::parse_from_rfc3339(date)
                        .ok()
                        .or_else(|| parse_relaxed_date(date))
                })
        })
        .map(|dt| dt.with_timezone(&Utc))
}

/// Dates that don't strictly conform to RFC 2822.
fn parse_relaxed_date(date: &str) -> Option<DateTime<FixedOffset>> {
    const FORMATS: &[&str] = &[
        "%a, %d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];
    FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(date.trim(), format).ok())
}

/// [`EpisodeSource`] over HTTP RSS feeds.
#[derive(Debug, Clone)]
pub struct FeedEpisodeSource {
    download_dir: PathBuf,
    client: reqwest::blocking::Client,
}

impl FeedEpisodeSource {
    /// Create a source that downloads below `download_dir`.
    pub fn new(download_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("syncnswim/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            download_dir: download_dir.into(),
            client,
        })
    }

    /// Local root for downloads.
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Where `episode` of `podcast_name` is (or will be) stored.
    pub fn local_path(&self, episode: &Episode, podcast_name: &str) -> PathBuf {
        self.download_dir
            .join(sanitize_filename(podcast_name))
            .join(episode.file_name())
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        self.client
            .get(url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|e| Error::fetch_failed(url, e))
    }
}

impl EpisodeSource for FeedEpisodeSource {
    fn latest_episode(&self, feed_url: &str) -> Result<Option<Episode>> {
        debug!("Fetching feed {}", feed_url);
        let body = self
            .get(feed_url)?
            .bytes()
            .map_err(|e| Error::fetch_failed(feed_url, e))?;
        parse_latest(&body, feed_url)
    }

    fn download(&self, episode: &Episode, podcast_name: &str) -> Result<PathBuf> {
        let path = self.local_path(episode, podcast_name);
        if path.exists() {
            info!("Episode already downloaded: {}", path.display());
            return Ok(path);
        }

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: dir.to_path_buf(),
                    reason: e.to_string(),
                })
            })?;
        }

        info!("Downloading: {} ({})", episode.title, episode.media_url);
        let mut response = self.get(&episode.media_url)?;

        let partial = path.with_extension("mp3.part");
        let write_failed = |e: &dyn std::fmt::Display| {
            Error::FileSystem(FileSystemError::WriteFailed {
                path: partial.clone(),
                reason: e.to_string(),
            })
        };

        let file = File::create(&partial).map_err(|e| write_failed(&e))?;
        let mut writer = BufWriter::new(file);
        let copied = response
            .copy_to(&mut writer)
            .map_err(|e| Error::fetch_failed(&episode.media_url, e))
            .and_then(|bytes| writer.flush().map(|()| bytes).map_err(|e| write_failed(&e)));

        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };

        fs::rename(&partial, &path).map_err(|e| write_failed(&e))?;
        info!("Downloaded {} bytes to {}", bytes, path.display());
        Ok(path)
    }
}
