//! Support for downloading the best video and audio streams described by a DASH manifest, and
//! muxing them into a single output file.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use fs_err as fs;
use bytes::Bytes;
use data_url::DataUrl;
use futures_util::stream::{self, StreamExt};
use reqwest::header::{ACCEPT, RANGE, REFERER};
use reqwest::StatusCode;
use tracing::{debug, info, trace, warn};
use url::Url;
use crate::VodgrabError;
use crate::ffmpeg::{FfmpegMuxer, Muxer};
use crate::manifest::{interpret, ByteRange, SegmentRef, SelectedTrack, TrackKind};
use crate::media::track_tempfile;


/// A `Client` from the `reqwest` crate, that we use to download content over HTTP.
pub type HttpClient = reqwest::Client;

/// Host serving the `{id}/master.mpd` manifests when no other base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://kinescope.io";

/// Maximum number of video segments merged into one range request.
pub const VIDEO_CHUNK_SEGMENTS: usize = 100;

/// Maximum number of audio segments merged into one range request.
pub const AUDIO_CHUNK_SEGMENTS: usize = 200;

/// Maximum size in octets of one merged range request.
pub const MAX_REQUEST_BYTES: u64 = 24_000_000;


/// Receives updates concerning the progression of the download, and can display this information to
/// the user, for example using a progress bar.
pub trait ProgressObserver: Send + Sync {
    fn update(&self, percent: u32, message: &str);
}


/// Build the manifest URL `{base_url}/{video_id}/master.mpd` for a video identifier.
///
/// The identifier is a single path component: it must be non-empty and may not contain `/`, `\`,
/// `?`, `#`, `:` or whitespace.
///
/// Example
/// ```rust
/// let url = vodgrab::manifest_url("https://kinescope.io", "201234567").unwrap();
/// assert_eq!(url.as_str(), "https://kinescope.io/201234567/master.mpd");
/// ```
pub fn manifest_url(base_url: &str, video_id: &str) -> Result<Url, VodgrabError> {
    let id = video_id.trim();
    if id.is_empty() {
        return Err(VodgrabError::Fetch(String::from("empty video identifier")));
    }
    if id == "." || id == ".." ||
        id.chars().any(|c| matches!(c, '/' | '\\' | '?' | '#' | ':') || c.is_whitespace())
    {
        return Err(VodgrabError::Fetch(format!("invalid video identifier {id:?}")));
    }
    let mut base = base_url.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    let base = Url::parse(&base)
        .map_err(|e| VodgrabError::Fetch(format!("invalid base URL {base_url}: {e}")))?;
    base.join(&format!("{id}/master.mpd"))
        .map_err(|e| VodgrabError::Fetch(format!("building manifest URL for {id}: {e}")))
}


/// Limits applied when merging byte-range segments that are contiguous in the same resource into a
/// single HTTP range request. The initialization segment is always fetched on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coalescing {
    pub video_segments: usize,
    pub audio_segments: usize,
    pub max_bytes: u64,
}

impl Default for Coalescing {
    fn default() -> Self {
        Coalescing {
            video_segments: VIDEO_CHUNK_SEGMENTS,
            audio_segments: AUDIO_CHUNK_SEGMENTS,
            max_bytes: MAX_REQUEST_BYTES,
        }
    }
}

impl Coalescing {
    fn max_segments(&self, kind: TrackKind) -> usize {
        match kind {
            TrackKind::Video => self.video_segments,
            TrackKind::Audio => self.audio_segments,
        }.max(1)
    }
}


// One HTTP request, covering `count` consecutive segments of a track starting at `first_index`
// (index 0 is the initialization segment).
#[derive(Debug, Clone, PartialEq, Eq)]
struct SegmentRequest {
    url: Url,
    range: Option<ByteRange>,
    first_index: usize,
    count: usize,
}

fn can_extend(last: &SegmentRequest, segment: &SegmentRef, limits: &Coalescing, kind: TrackKind) -> bool {
    match (last.range, segment.range) {
        (Some(lr), Some(sr)) => {
            last.first_index > 0 &&
                last.url == segment.url &&
                last.count < limits.max_segments(kind) &&
                lr.end.checked_add(1) == Some(sr.start) &&
                sr.end - lr.start < limits.max_bytes
        },
        _ => false,
    }
}

fn plan_requests(track: &SelectedTrack, coalescing: Option<&Coalescing>) -> Vec<SegmentRequest> {
    let mut requests: Vec<SegmentRequest> = Vec::with_capacity(track.segment_count());
    for (index, segment) in track.segments().enumerate() {
        if let (Some(limits), Some(last)) = (coalescing, requests.last_mut()) {
            if can_extend(last, segment, limits, track.kind) {
                if let (Some(lr), Some(sr)) = (last.range.as_mut(), segment.range) {
                    lr.end = sr.end;
                }
                last.count += 1;
                continue;
            }
        }
        requests.push(SegmentRequest {
            url: segment.url.clone(),
            range: segment.range,
            first_index: index,
            count: 1,
        });
    }
    requests
}


// Progress is counted in requests, plus one step for the manifest and one for muxing.
struct Progress {
    done: usize,
    total: usize,
}

impl Progress {
    fn percent(&self) -> u32 {
        let pc = (100.0 * self.done as f32 / self.total.max(1) as f32).ceil();
        pc.min(99.0) as u32
    }
}


/// The `Downloader` allows the download of the best video and audio streams of a DASH manifest,
/// muxed into a single container file.
///
/// Example
/// ```rust,no_run
/// use vodgrab::{manifest_url, Downloader};
///
/// # async fn demo() -> Result<(), vodgrab::VodgrabError> {
/// let url = manifest_url("https://kinescope.io", "201234567")?;
/// let path = Downloader::new(url.as_str())
///     .with_referer("https://kinescope.io")
///     .download_to("/tmp/201234567.mp4")
///     .await?;
/// println!("Downloaded to {path:?}");
/// # Ok(())
/// # }
/// ```
pub struct Downloader {
    pub manifest_url: String,
    http_client: Option<HttpClient>,
    referer: Option<String>,
    muxer: Arc<dyn Muxer>,
    tmp_dir: Option<PathBuf>,
    coalescing: Option<Coalescing>,
    concurrent_fetches: usize,
    progress_observers: Vec<Arc<dyn ProgressObserver>>,
}

impl Downloader {
    /// Create a `Downloader` for the DASH manifest at `manifest_url`.
    pub fn new(manifest_url: &str) -> Downloader {
        Downloader {
            manifest_url: String::from(manifest_url),
            http_client: None,
            referer: None,
            muxer: Arc::new(FfmpegMuxer::default()),
            tmp_dir: None,
            coalescing: Some(Coalescing::default()),
            concurrent_fetches: 1,
            progress_observers: vec![],
        }
    }

    /// Specify the reqwest Client to be used for HTTP requests. Allows you to specify a proxy, the
    /// user agent, request timeouts, additional root certificates to trust, etc.
    pub fn with_http_client(mut self, client: HttpClient) -> Downloader {
        self.http_client = Some(client);
        self
    }

    /// Send this value in the `Referer` header of the manifest and segment requests. Some hosts
    /// refuse requests that lack it.
    pub fn with_referer(mut self, referer: &str) -> Downloader {
        self.referer = Some(String::from(referer));
        self
    }

    /// Use `muxer` to combine the downloaded streams instead of ffmpeg.
    pub fn with_muxer(mut self, muxer: Arc<dyn Muxer>) -> Downloader {
        self.muxer = muxer;
        self
    }

    /// Specify the location of the `ffmpeg` application, if not located in PATH.
    pub fn with_ffmpeg(self, ffmpeg_path: &str) -> Downloader {
        self.with_muxer(Arc::new(FfmpegMuxer::with_location(ffmpeg_path)))
    }

    /// Create the temporary stream files in `dir` instead of the system temporary directory.
    pub fn with_tmp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Downloader {
        self.tmp_dir = Some(dir.into());
        self
    }

    pub fn with_segment_coalescing(mut self, coalescing: Coalescing) -> Downloader {
        self.coalescing = Some(coalescing);
        self
    }

    /// Issue one request per segment, even for contiguous byte ranges.
    pub fn without_segment_coalescing(mut self) -> Downloader {
        self.coalescing = None;
        self
    }

    /// Number of segment requests kept in flight at once. Content is always written in segment
    /// order. The default value of 1 fetches segments strictly one after the other.
    pub fn concurrent_fetches(mut self, count: usize) -> Downloader {
        self.concurrent_fetches = count.max(1);
        self
    }

    /// Add a observer implementing the ProgressObserver trait, that will receive updates concerning
    /// the progression of the download (allows implementation of a progress bar, for example).
    pub fn add_progress_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Downloader {
        self.progress_observers.push(observer);
        self
    }

    /// Download the best video and audio streams and mux them to the file named by `out`. If the
    /// output file already exists, its content will be overwritten. The container format is chosen
    /// by the muxer from the filename extension of `out`.
    pub async fn download_to<P: Into<PathBuf>>(mut self, out: P) -> Result<PathBuf, VodgrabError> {
        let output_path = out.into();
        let client = match self.http_client.take() {
            Some(c) => c,
            None => http_client(Duration::new(30, 0))?,
        };
        fetch_mpd(&self, &client, &output_path).await
    }

    fn notify(&self, percent: u32, message: &str) {
        for observer in &self.progress_observers {
            observer.update(percent, message);
        }
    }

    async fn fetch_track(
        &self,
        client: &HttpClient,
        track: &SelectedTrack,
        requests: &[SegmentRequest],
        sink: &mut std::fs::File,
        progress: &mut Progress) -> Result<(), VodgrabError>
    {
        let kind = track.kind;
        let start_download = Instant::now();
        info!("Fetching {} {kind} segments in {} requests", track.segment_count(), requests.len());
        let referer = self.referer.as_deref();
        let mut out = BufWriter::new(sink);
        let mut bodies = pin!(stream::iter(requests)
            .map(|request| fetch_segment(client, referer, kind, request))
            .buffered(self.concurrent_fetches));
        let mut written: u64 = 0;
        let message = format!("Fetching {kind} segments");
        while let Some(body) = bodies.next().await {
            let body = body?;
            out.write_all(&body)
                .map_err(|e| VodgrabError::Io(e, format!("writing {kind} stream")))?;
            written += body.len() as u64;
            progress.done += 1;
            self.notify(progress.percent(), &message);
        }
        out.flush()
            .map_err(|e| VodgrabError::Io(e, format!("flushing {kind} stream")))?;
        let elapsed = start_download.elapsed();
        let mbytes = written as f64 / (1024.0 * 1024.0);
        info!("Wrote {mbytes:.1}MB to {kind} stream ({:.1}MB/s)",
              mbytes / elapsed.as_secs_f64().max(0.001));
        Ok(())
    }
}


fn network_error(why: &str, e: impl std::fmt::Display) -> VodgrabError {
    VodgrabError::Fetch(format!("{why}: {e}"))
}

/// Build an HTTP client that gives up when establishing a connection takes longer than `timeout`,
/// or when no data is received for `timeout` while reading a response. There is no limit on the
/// total duration of a request, so that large range requests complete on slow links.
pub fn http_client(timeout: Duration) -> Result<HttpClient, VodgrabError> {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()
        .map_err(|e| network_error("building HTTP client", e))
}

async fn fetch_manifest(
    client: &HttpClient,
    url: &str,
    referer: Option<&str>) -> Result<(Url, String), VodgrabError>
{
    info!("Fetching the DASH manifest {url}");
    let mut req = client.get(url)
        .header(ACCEPT, "application/dash+xml,video/vnd.mpeg.dash.mpd");
    if let Some(r) = referer {
        req = req.header(REFERER, r);
    }
    let response = req.send().await
        .map_err(|e| network_error("requesting DASH manifest", e))?;
    if !response.status().is_success() {
        let msg = format!("fetching DASH manifest {url} (HTTP {})", response.status().as_str());
        return Err(VodgrabError::Fetch(msg));
    }
    // Relative references in the manifest resolve against the final URL after redirects.
    let redirected_url = response.url().clone();
    let xml = response.text().await
        .map_err(|e| network_error("reading DASH manifest", e))?;
    debug!("DASH manifest {redirected_url} -> {} octets", xml.len());
    Ok((redirected_url, xml))
}

// A manifest may use a data URL (RFC 2397) to embed media content such as the initialization
// segment directly in the manifest.
fn decode_data_url(url: &Url, range: Option<ByteRange>) -> Result<Bytes, String> {
    let du = DataUrl::process(url.as_str())
        .map_err(|e| format!("parsing data URL: {e:?}"))?;
    let (body, _fragment) = du.decode_to_vec()
        .map_err(|e| format!("decoding data URL: {e:?}"))?;
    match range {
        None => Ok(Bytes::from(body)),
        Some(r) => usize::try_from(r.start).ok()
            .zip(usize::try_from(r.end).ok())
            .and_then(|(start, end)| body.get(start..=end))
            .map(Bytes::copy_from_slice)
            .ok_or_else(|| format!("range {}-{} outside data URL content", r.start, r.end)),
    }
}

// The octets of `range` in the response to a range request. A 206 response must hold exactly the
// requested octets; a 200 response holds the whole resource, from which the range is extracted.
fn range_content(status: StatusCode, body: Bytes, range: ByteRange) -> Result<Bytes, String> {
    let len = body.len() as u64;
    match status {
        StatusCode::PARTIAL_CONTENT if len == range.len() => Ok(body),
        StatusCode::PARTIAL_CONTENT =>
            Err(format!("received {len} octets for range {}-{} ({} octets)",
                        range.start, range.end, range.len())),
        StatusCode::OK if range.end < len => {
            let start = usize::try_from(range.start).map_err(|e| e.to_string())?;
            let end = usize::try_from(range.end).map_err(|e| e.to_string())?;
            Ok(body.slice(start..=end))
        },
        StatusCode::OK =>
            Err(format!("range {}-{} beyond end of {len}-octet resource", range.start, range.end)),
        _ => Err(format!("unexpected HTTP {} for range request", status.as_str())),
    }
}

async fn fetch_segment(
    client: &HttpClient,
    referer: Option<&str>,
    kind: TrackKind,
    request: &SegmentRequest) -> Result<Bytes, VodgrabError>
{
    let failure = |reason: String| VodgrabError::SegmentFetch {
        track: kind,
        index: request.first_index,
        url: request.url.to_string(),
        reason,
    };
    if request.url.scheme() == "data" {
        let body = decode_data_url(&request.url, request.range).map_err(failure)?;
        debug!("{kind} segment #{} data URL -> {} octets", request.first_index, body.len());
        return Ok(body);
    }
    let mut req = client.get(request.url.clone());
    if let Some(r) = referer {
        req = req.header(REFERER, r);
    }
    if let Some(range) = &request.range {
        req = req.header(RANGE, range.header_value());
    }
    let response = req.send().await
        .map_err(|e| failure(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(failure(format!("HTTP {}", status.as_str())));
    }
    let body = response.bytes().await
        .map_err(|e| failure(format!("reading response body: {e}")))?;
    let body = match request.range {
        Some(r) => {
            if status == StatusCode::OK {
                warn!("Server ignored range request for {}", request.url);
            }
            range_content(status, body, r).map_err(failure)?
        },
        None => body,
    };
    match request.range {
        Some(r) => debug!("{kind} segment #{} {} range {}-{} ({} segments) -> {} octets",
                          request.first_index, request.url, r.start, r.end, request.count, body.len()),
        None => debug!("{kind} segment #{} {} -> {} octets",
                       request.first_index, request.url, body.len()),
    }
    Ok(body)
}

async fn fetch_mpd(
    downloader: &Downloader,
    client: &HttpClient,
    output_path: &Path) -> Result<PathBuf, VodgrabError>
{
    downloader.notify(1, "Fetching DASH manifest");
    let (redirected_url, xml) =
        fetch_manifest(client, &downloader.manifest_url, downloader.referer.as_deref()).await?;
    let tracks = interpret(&xml, &redirected_url)?;
    let video_requests = plan_requests(&tracks.video, downloader.coalescing.as_ref());
    let audio_requests = plan_requests(&tracks.audio, downloader.coalescing.as_ref());
    trace!("video requests: {video_requests:?}");
    trace!("audio requests: {audio_requests:?}");
    let mut progress = Progress {
        done: 1,
        total: video_requests.len() + audio_requests.len() + 2,
    };
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| VodgrabError::Io(e, String::from("creating output directory")))?;
        }
    }
    // The temporary files are deleted when dropped, including on the early returns below.
    let mut tmpfile_video = track_tempfile(downloader.tmp_dir.as_deref(), TrackKind::Video)?;
    downloader.fetch_track(client, &tracks.video, &video_requests,
                           tmpfile_video.as_file_mut(), &mut progress).await?;
    let mut tmpfile_audio = track_tempfile(downloader.tmp_dir.as_deref(), TrackKind::Audio)?;
    downloader.fetch_track(client, &tracks.audio, &audio_requests,
                           tmpfile_audio.as_file_mut(), &mut progress).await?;
    downloader.notify(99, "Muxing audio and video");
    if let Err(e) = downloader.muxer.combine(tmpfile_video.path(), tmpfile_audio.path(), output_path) {
        if output_path.exists() {
            if let Err(re) = fs::remove_file(output_path) {
                warn!("Failed to delete partial output file: {re}");
            }
        }
        return Err(e);
    }
    for tmp in [tmpfile_video, tmpfile_audio] {
        if let Err(e) = tmp.close() {
            warn!("Failed to delete temporary file: {e}");
        }
    }
    if let Ok(meta) = fs::metadata(output_path) {
        info!("Wrote {:.1}MB to {}", meta.len() as f64 / (1024.0 * 1024.0), output_path.display());
    }
    downloader.notify(100, "Done");
    Ok(output_path.to_path_buf())
}
